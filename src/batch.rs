//! Replay batches.
//!
//! The Applier pulls records from the global log in batches and hands each
//! batch to [`DocumentStore::replay_batch`](crate::store::DocumentStore::replay_batch),
//! which applies the whole batch and the new checkpoint in one transaction.
//!
//! ```text
//! GOL ──read_batch(after, max_records)──▶ ReplayBatch ──▶ replay_batch()
//!                                             │                │
//!                                             │ strictly       ▼
//!                                             │ increasing   ReplayReport
//!                                             ▼ global_seq   (per outcome)
//!                                        last_position ──▶ confirm()
//! ```
//!
//! Records are never coalesced per key: every intermediate write carries a
//! marker the conflict detector needs.

use crate::config::ApplierConfig;
use crate::conflict::Outcome;
use crate::error::{GlobalSyncError, Result};
use crate::record::OperationRecord;
use std::time::Duration;

/// Configuration for replay batching.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum records per replay transaction.
    pub max_records: usize,
    /// How long to wait for new records when caught up.
    pub idle_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            idle_wait: Duration::from_secs(1),
        }
    }
}

impl BatchConfig {
    pub fn from_applier(config: &ApplierConfig) -> Self {
        Self {
            max_records: config.batch_size.max(1),
            idle_wait: config.idle_wait_duration(),
        }
    }

    /// Small batches and short waits for testing.
    pub fn testing() -> Self {
        Self {
            max_records: 10,
            idle_wait: Duration::from_millis(20),
        }
    }
}

/// An ordered run of GOL records.
#[derive(Debug, Clone, Default)]
pub struct ReplayBatch {
    records: Vec<OperationRecord>,
}

impl ReplayBatch {
    /// Wrap records read from the log. Rejects out-of-order input.
    pub fn new(records: Vec<OperationRecord>) -> Result<Self> {
        if let Some(pair) = records
            .windows(2)
            .find(|w| w[1].global_seq <= w[0].global_seq)
        {
            return Err(GlobalSyncError::Internal(format!(
                "replay batch out of order: {} followed by {}",
                pair[0].global_seq, pair[1].global_seq
            )));
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_position(&self) -> Option<u64> {
        self.records.first().map(|r| r.global_seq)
    }

    pub fn last_position(&self) -> Option<u64> {
        self.records.last().map(|r| r.global_seq)
    }
}

/// Result of replaying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records handed to the store.
    pub total: usize,
    /// Took effect without a collision.
    pub applied: usize,
    /// Idempotent no-ops.
    pub noop: usize,
    /// Document clock already covered the record.
    pub already_applied: usize,
    /// Records this node produced itself.
    pub skipped_own: usize,
    /// At or below the stored checkpoint.
    pub skipped_replayed: usize,
    /// Collisions, each with one Conflict Record.
    pub conflicts: usize,
    pub anomalies: usize,
    /// Checkpoint after the batch.
    pub last_position: u64,
}

impl ReplayReport {
    /// Count one reconciled record.
    pub fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::NoOp => self.noop += 1,
            Outcome::AlreadyApplied => self.already_applied += 1,
            Outcome::Resolved(_) => self.conflicts += 1,
        }
    }

    /// Records that changed nothing.
    pub fn skipped(&self) -> usize {
        self.noop + self.already_applied + self.skipped_own + self.skipped_replayed
    }

    /// Every record was accounted for.
    pub fn is_success(&self) -> bool {
        self.applied + self.conflicts + self.skipped() == self.total
    }
}
