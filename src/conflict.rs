//! Conflict Detector and resolution policy.
//!
//! Pure functions over a [`DocumentState`] and an incoming
//! [`OperationRecord`]. No I/O happens here; the store calls
//! [`reconcile`] inside its replay transaction.
//!
//! # Concurrency
//!
//! A marker `c` stored on the document is *concurrent* with an incoming
//! record `r` when `r.observed` does not cover `c`: the origin of `r` had not
//! seen that write when it produced `r`. Markers `r` had observed are simply
//! superseded.
//!
//! # Resolution
//!
//! | Incoming | Against | Effect |
//! |----------|---------|--------|
//! | write field `f` | concurrent marker on `f` or concurrent delete | lands iff its stamp is larger |
//! | insert | observed fields it does not write | removed (replace) |
//! | insert | concurrent fields it does not write | kept |
//! | delete | observed fields and presence | removed |
//! | delete | concurrent fields and presence | removed iff the delete's stamp is larger |
//!
//! The tie-break is the lexicographic `(origin_timestamp, origin_id)` order of
//! [`Stamp`], so every destination reaches the same state regardless of which
//! of two concurrent records it applies first.
//!
//! # Labels
//!
//! | Label | Meaning |
//! |-------|---------|
//! | `Merge` | collision on the document, fields disjoint |
//! | `IncomingWins` | every overlapping field took the incoming value |
//! | `LocalWins` | every overlapping field kept the local value |
//! | `Split` | overlapping fields went both ways |
//! | `DeleteWins` | delete versus write, the document ends up absent |
//! | `Resurrection` | delete versus write, the write undid the delete |

use crate::conflicts_log::{ConflictRecord, ConflictStatus};
use crate::document::{DocumentState, FieldEntry};
use crate::error::GlobalSyncError;
use crate::record::{Fields, OpKind, OperationRecord, Stamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unit at which concurrent writes count as colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Any concurrent write to the document collides.
    #[default]
    Document,
    /// Only concurrent writes to the same field, or delete versus write.
    Field,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Document => f.write_str("document"),
            Granularity::Field => f.write_str("field"),
        }
    }
}

impl FromStr for Granularity {
    type Err = GlobalSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Granularity::Document),
            "field" => Ok(Granularity::Field),
            other => Err(GlobalSyncError::Config(format!(
                "unknown conflict granularity '{}'",
                other
            ))),
        }
    }
}

/// How a detected conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Concurrent writes touched disjoint fields; both kept.
    Merge,
    /// The incoming record carried the larger stamp on every contested field.
    IncomingWins,
    /// The local version carried the larger stamp on every contested field.
    LocalWins,
    /// Contested fields went different ways.
    Split,
    /// Delete and write collided; the delete held and the document is gone.
    DeleteWins,
    /// Delete and write collided; the write outranked the delete and the
    /// document lives on.
    Resurrection,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Merge => "merge",
            Resolution::IncomingWins => "incoming_wins",
            Resolution::LocalWins => "local_wins",
            Resolution::Split => "split",
            Resolution::DeleteWins => "delete_wins",
            Resolution::Resurrection => "resurrection",
        }
    }

    /// Per-side statuses recorded in the conflicts log.
    pub fn statuses(&self, incoming_applied: bool) -> (ConflictStatus, ConflictStatus) {
        match self {
            Resolution::Merge | Resolution::Split => (ConflictStatus::Merged, ConflictStatus::Merged),
            _ if incoming_applied => (ConflictStatus::OldReplaced, ConflictStatus::New),
            _ => (ConflictStatus::Old, ConflictStatus::NewIgnored),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the detector found before anything is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub conflict: bool,
    /// Every concurrent marker on the document.
    pub concurrent: Vec<Stamp>,
    /// Fields the record writes that carry a concurrent marker.
    pub overlapping: Vec<String>,
    /// Delete on one side, write on the other.
    pub delete_collision: bool,
}

/// Result of replaying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No collision; the record took effect.
    Applied,
    /// Idempotent no-op: delete of an absent document, or re-insert of
    /// identical content.
    NoOp,
    /// The document already reflects this record.
    AlreadyApplied,
    Resolved(Resolution),
}

/// A non-conflicting record that still did something unexpected.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub record: OperationRecord,
    /// Document content the record ran into.
    pub existing: Fields,
    pub description: String,
}

/// Output of [`reconcile`].
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Document state after the record; unchanged for `AlreadyApplied`.
    pub state: DocumentState,
    pub outcome: Outcome,
    /// Set whenever the detector flagged a conflict.
    pub conflict: Option<ConflictRecord>,
    pub anomaly: Option<Anomaly>,
}

fn is_concurrent(record: &OperationRecord, stamp: &Stamp) -> bool {
    !record.observed.covers(stamp)
}

/// Largest concurrent delete, the competitor for every register.
fn concurrent_tombstone(state: &DocumentState, record: &OperationRecord) -> Option<Stamp> {
    state
        .tombstones()
        .filter(|t| is_concurrent(record, t))
        .max()
}

pub fn detect(
    state: &DocumentState,
    record: &OperationRecord,
    granularity: Granularity,
) -> Detection {
    let concurrent_fields: Vec<(&String, &Stamp)> = state
        .fields
        .iter()
        .filter(|(_, entry)| is_concurrent(record, &entry.stamp))
        .map(|(name, entry)| (name, &entry.stamp))
        .collect();
    let concurrent_presence = state
        .presence
        .as_ref()
        .filter(|p| is_concurrent(record, p));
    let concurrent_deletes: Vec<Stamp> = state
        .tombstones()
        .filter(|t| is_concurrent(record, t))
        .collect();

    let overlapping: Vec<String> = if record.op_kind.is_write() {
        concurrent_fields
            .iter()
            .filter(|(name, _)| record.patch.contains_key(name.as_str()))
            .map(|(name, _)| (*name).clone())
            .collect()
    } else {
        Vec::new()
    };

    let delete_collision = match record.op_kind {
        OpKind::Delete => !concurrent_fields.is_empty() || concurrent_presence.is_some(),
        OpKind::Insert | OpKind::Update => !concurrent_deletes.is_empty(),
    };

    let mut concurrent: Vec<Stamp> = concurrent_fields
        .iter()
        .map(|(_, stamp)| (*stamp).clone())
        .chain(concurrent_presence.cloned())
        .chain(concurrent_deletes)
        .collect();
    concurrent.sort();
    concurrent.dedup();

    let conflict = match granularity {
        Granularity::Document => !concurrent.is_empty(),
        Granularity::Field => {
            !overlapping.is_empty()
                || delete_collision
                || (record.op_kind == OpKind::Insert && concurrent_presence.is_some())
        }
    };

    Detection {
        conflict,
        concurrent,
        overlapping,
        delete_collision,
    }
}

/// Apply `record` to `state` under the resolution policy.
pub fn reconcile(
    state: &DocumentState,
    record: &OperationRecord,
    granularity: Granularity,
    detected_at: i64,
) -> Reconciliation {
    let stamp = record.stamp();
    if state.has_applied(&stamp) {
        return Reconciliation {
            state: state.clone(),
            outcome: Outcome::AlreadyApplied,
            conflict: None,
            anomaly: None,
        };
    }

    let detection = detect(state, record, granularity);
    let mut next = state.clone();
    next.clock.merge(&record.observed);
    next.clock.advance(&stamp);

    let mut discarded_local = Fields::new();
    let mut discarded_incoming = Fields::new();
    let mut anomaly = None;

    let (outcome, incoming_applied) = match record.op_kind {
        OpKind::Insert | OpKind::Update => {
            if record.op_kind == OpKind::Insert
                && detection.concurrent.is_empty()
                && state.is_live()
            {
                let existing = state.content().unwrap_or_default();
                if existing == record.patch {
                    return Reconciliation {
                        state: next,
                        outcome: Outcome::NoOp,
                        conflict: None,
                        anomaly: None,
                    };
                }
                anomaly = Some(Anomaly {
                    record: record.clone(),
                    existing,
                    description: "insert over a live document with different content; replaced"
                        .to_string(),
                });
            }

            let tombstone = concurrent_tombstone(state, record);
            let mut won = Vec::new();

            if record.op_kind == OpKind::Insert {
                next.fields.retain(|name, entry| {
                    record.patch.contains_key(name) || is_concurrent(record, &entry.stamp)
                });
            }

            for (name, value) in &record.patch {
                let local = state
                    .fields
                    .get(name)
                    .filter(|entry| is_concurrent(record, &entry.stamp));
                let competitor = local.map(|entry| &entry.stamp).max(tombstone.as_ref());
                match competitor {
                    Some(c) if *c > stamp => {
                        discarded_incoming.insert(name.clone(), value.clone());
                    }
                    _ => {
                        if let Some(entry) = local {
                            discarded_local.insert(name.clone(), entry.value.clone());
                        }
                        won.push(name.clone());
                        next.fields.insert(
                            name.clone(),
                            FieldEntry {
                                value: value.clone(),
                                stamp: stamp.clone(),
                            },
                        );
                    }
                }
            }

            let presence_competitor = state
                .presence
                .as_ref()
                .filter(|p| is_concurrent(record, p))
                .max(tombstone.as_ref());
            let presence_landed = !matches!(presence_competitor, Some(c) if *c > stamp);
            if presence_landed {
                next.presence = Some(stamp.clone());
            }

            let landed = presence_landed || !won.is_empty();
            let outcome = if !detection.conflict {
                Outcome::Applied
            } else if detection.delete_collision {
                Outcome::Resolved(if landed {
                    Resolution::Resurrection
                } else {
                    Resolution::DeleteWins
                })
            } else if detection.overlapping.is_empty() {
                Outcome::Resolved(Resolution::Merge)
            } else {
                let overlap_won = detection
                    .overlapping
                    .iter()
                    .filter(|name| won.contains(name))
                    .count();
                Outcome::Resolved(if overlap_won == detection.overlapping.len() {
                    Resolution::IncomingWins
                } else if overlap_won == 0 {
                    Resolution::LocalWins
                } else {
                    Resolution::Split
                })
            };
            (outcome, landed)
        }
        OpKind::Delete => {
            next.deletes.advance(&stamp);
            next.fields.retain(|name, entry| {
                let survives = is_concurrent(record, &entry.stamp) && entry.stamp > stamp;
                if !survives && is_concurrent(record, &entry.stamp) {
                    discarded_local.insert(name.clone(), entry.value.clone());
                }
                survives
            });
            let presence_survives = state
                .presence
                .as_ref()
                .is_some_and(|p| is_concurrent(record, p) && *p > stamp);
            if !presence_survives {
                next.presence = None;
            }

            let outcome = if detection.conflict {
                Outcome::Resolved(if next.is_live() {
                    Resolution::Resurrection
                } else {
                    Resolution::DeleteWins
                })
            } else if state.is_live() {
                Outcome::Applied
            } else {
                Outcome::NoOp
            };
            (outcome, !next.is_live())
        }
    };

    let conflict = match outcome {
        Outcome::Resolved(resolution) => {
            let (local_status, incoming_status) = resolution.statuses(incoming_applied);
            Some(ConflictRecord {
                namespace: record.namespace.clone(),
                document_key: record.document_key.clone(),
                local_version: state.content(),
                local_marker: state.version_marker(),
                incoming_version: record.clone(),
                resolution,
                local_status,
                incoming_status,
                discarded_local,
                discarded_incoming,
                detected_at,
                destination_id: String::new(),
            })
        }
        _ => None,
    };

    Reconciliation {
        state: next,
        outcome,
        conflict,
        anomaly,
    }
}
