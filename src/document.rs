//! Per-document replicated state.
//!
//! A stored document is a set of last-writer-wins registers: one per field
//! plus a presence register that decides whether the document exists. Each
//! register remembers the [`Stamp`] of the write that set it. Deletes are
//! remembered per origin in `deletes`, so a late concurrent write can still
//! be compared against them. `clock` is the history of every write the state
//! reflects and is what local writes report as `observed`.

use crate::record::{Fields, Stamp, VectorTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field value plus the marker of the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: serde_json::Value,
    pub stamp: Stamp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub fields: BTreeMap<String, FieldEntry>,
    /// Stamp of the write that keeps the document alive. `None` = absent.
    pub presence: Option<Stamp>,
    /// Latest delete per origin.
    pub deletes: VectorTime,
    pub clock: VectorTime,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self) -> bool {
        self.presence.is_some()
    }

    /// Visible content, `None` when the document does not exist.
    pub fn content(&self) -> Option<Fields> {
        if !self.is_live() {
            return None;
        }
        Some(
            self.fields
                .iter()
                .map(|(name, entry)| (name.clone(), entry.value.clone()))
                .collect(),
        )
    }

    pub fn field_marker(&self, field: &str) -> Option<&Stamp> {
        self.fields.get(field).map(|entry| &entry.stamp)
    }

    pub fn tombstones(&self) -> impl Iterator<Item = Stamp> + '_ {
        self.deletes
            .iter()
            .map(|(origin, ts)| Stamp::new(origin.clone(), *ts))
    }

    /// Document-granularity version marker: the most recent writer.
    pub fn version_marker(&self) -> Option<Stamp> {
        self.fields
            .values()
            .map(|entry| entry.stamp.clone())
            .chain(self.presence.clone())
            .chain(self.tombstones())
            .max()
    }

    /// Whether the write identified by `stamp` is already reflected here.
    pub fn has_applied(&self, stamp: &Stamp) -> bool {
        self.clock.covers(stamp)
    }
}
