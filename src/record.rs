//! Operation records and the version-vector types they carry.
//!
//! An [`OperationRecord`] is the unit moved through the whole pipeline:
//! origins produce [`LocalOperation`]s, the Source Tailer stamps them with
//! the origin id, and the Global Operation Log assigns the `global_seq`.
//!
//! # Stamps and vector time
//!
//! Every write carries a [`Stamp`] `(origin_timestamp, origin_id)`. Stamps
//! are totally ordered lexicographically, which makes them the conflict
//! tie-break key. They are derived only from data inside the record, so every
//! destination breaks ties the same way regardless of arrival order.
//!
//! Each write also carries the [`VectorTime`] its origin had observed for the
//! document at write time. Two writes are concurrent when neither vector
//! covers the other's stamp.

use crate::error::{GlobalSyncError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field name to value map. Ordered so that hashing and JSON output are canonical.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Collection identifier, `"<db>.<collection>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Build a namespace, rejecting names without a database part.
    pub fn new(ns: impl Into<String>) -> Result<Self> {
        let ns = ns.into();
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self(ns)),
            _ => Err(GlobalSyncError::Config(format!(
                "namespace '{}' must be '<db>.<collection>'",
                ns
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn db(&self) -> &str {
        self.0.split_once('.').map(|(db, _)| db).unwrap_or(&self.0)
    }

    pub fn collection(&self) -> &str {
        self.0.split_once('.').map(|(_, coll)| coll).unwrap_or("")
    }

    /// Sibling namespace holding this collection's conflict records.
    pub fn conflicts(&self) -> String {
        format!("{}.conflicts", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Namespace {
    type Err = GlobalSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifying key of a document, stable across the document's life.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(pub String);

impl DocumentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of write an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// `patch` is the full document.
    Insert,
    /// `patch` is the set of fields being written.
    Update,
    /// `patch` is empty.
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, OpKind::Delete)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = GlobalSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" | "i" => Ok(OpKind::Insert),
            "update" | "u" => Ok(OpKind::Update),
            "delete" | "d" => Ok(OpKind::Delete),
            other => Err(GlobalSyncError::RecordParse(format!(
                "unknown op kind '{}'",
                other
            ))),
        }
    }
}

/// Largest `origin_timestamp` a record may carry. Timestamps are stored in
/// signed SQLite integers.
pub const MAX_ORIGIN_TIMESTAMP: u64 = i64::MAX as u64;

/// Version marker of one write: `(origin_timestamp, origin_id)`.
///
/// Field order matters: the derived `Ord` compares the timestamp first and
/// the origin id second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub origin_timestamp: u64,
    pub origin_id: String,
}

impl Stamp {
    pub fn new(origin_id: impl Into<String>, origin_timestamp: u64) -> Self {
        Self {
            origin_timestamp,
            origin_id: origin_id.into(),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.origin_timestamp, self.origin_id)
    }
}

/// Highest origin timestamp observed per origin.
///
/// Absent origins count as zero, so an empty vector has observed nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorTime(BTreeMap<String, u64>);

impl VectorTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin_id: &str) -> u64 {
        self.0.get(origin_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }

    /// Whether the write identified by `stamp` is part of this history.
    pub fn covers(&self, stamp: &Stamp) -> bool {
        self.get(&stamp.origin_id) >= stamp.origin_timestamp
    }

    /// Include `stamp` in this history.
    pub fn advance(&mut self, stamp: &Stamp) {
        let entry = self.0.entry(stamp.origin_id.clone()).or_insert(0);
        if *entry < stamp.origin_timestamp {
            *entry = stamp.origin_timestamp;
        }
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VectorTime) {
        for (origin, ts) in &other.0 {
            let entry = self.0.entry(origin.clone()).or_insert(0);
            if *entry < *ts {
                *entry = *ts;
            }
        }
    }

    fn dominated_by(&self, other: &VectorTime) -> bool {
        self.0.iter().all(|(origin, ts)| other.get(origin) >= *ts)
    }

    /// Partial order over histories; `None` means concurrent.
    pub fn partial_cmp_time(&self, other: &VectorTime) -> Option<Ordering> {
        match (self.dominated_by(other), other.dominated_by(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    pub fn happened_before(&self, other: &VectorTime) -> bool {
        self.partial_cmp_time(other) == Some(Ordering::Less)
    }

    pub fn concurrent_with(&self, other: &VectorTime) -> bool {
        self.partial_cmp_time(other).is_none()
    }
}

/// One entry of an origin's local operation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalOperation {
    /// Position in the origin's stream, gapless and strictly increasing.
    pub origin_seq: u64,
    pub op_kind: OpKind,
    pub namespace: Namespace,
    pub document_key: DocumentKey,
    pub patch: Fields,
    pub origin_timestamp: u64,
    /// Document clock at the origin when the write was made.
    pub observed: VectorTime,
}

/// A local operation after it entered the Global Operation Log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Assigned by the log; zero until appended.
    pub global_seq: u64,
    pub origin_id: String,
    pub origin_seq: u64,
    pub op_kind: OpKind,
    pub namespace: Namespace,
    pub document_key: DocumentKey,
    pub patch: Fields,
    pub origin_timestamp: u64,
    pub observed: VectorTime,
}

impl OperationRecord {
    pub fn from_local(origin_id: impl Into<String>, op: LocalOperation) -> Self {
        Self {
            global_seq: 0,
            origin_id: origin_id.into(),
            origin_seq: op.origin_seq,
            op_kind: op.op_kind,
            namespace: op.namespace,
            document_key: op.document_key,
            patch: op.patch,
            origin_timestamp: op.origin_timestamp,
            observed: op.observed,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.origin_id.clone(), self.origin_timestamp)
    }

    /// SHA-256 of the canonical JSON patch, hex encoded.
    pub fn content_hash(&self) -> String {
        compute_patch_hash(&self.patch)
    }
}

/// Hash a patch the same way on every node.
pub fn compute_patch_hash(patch: &Fields) -> String {
    // BTreeMap serializes in key order, so the bytes are canonical.
    let bytes = serde_json::to_vec(patch).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}
