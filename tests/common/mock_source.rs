//! Scripted origin stream for tailer tests.
//!
//! Serves a fixed list of operations and can simulate upstream trimming,
//! injected transient failures, and crash-restart re-derivation.

use global_sync::source::BoxFuture;
use global_sync::{
    DocumentKey, Fields, GlobalSyncError, LocalOperation, Namespace, OpKind, OperationSource,
    SourceBatch, VectorTime,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Origin stream backed by a `Vec<LocalOperation>`.
pub struct ScriptedSource {
    origin_id: String,
    ops: Mutex<Vec<LocalOperation>>,
    trimmed_through: Mutex<u64>,
    failures_remaining: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(origin_id: &str, ops: Vec<LocalOperation>) -> Self {
        Self {
            origin_id: origin_id.to_string(),
            ops: Mutex::new(ops),
            trimmed_through: Mutex::new(0),
            failures_remaining: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// `count` updates on `namespace`, one per key, sequences `1..=count`.
    pub fn with_updates(origin_id: &str, namespace: &Namespace, count: u64) -> Self {
        Self::new(
            origin_id,
            (1..=count).map(|seq| update(seq, namespace, &format!("k{}", seq))).collect(),
        )
    }

    pub fn push(&self, op: LocalOperation) {
        self.ops.lock().unwrap().push(op);
    }

    /// Drop everything up to and including `origin_seq`, as an upstream
    /// log would after retention.
    pub fn trim_through(&self, origin_seq: u64) {
        *self.trimmed_through.lock().unwrap() = origin_seq;
        self.ops.lock().unwrap().retain(|o| o.origin_seq > origin_seq);
    }

    /// Fail the next `count` fetches with a connection error.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl OperationSource for ScriptedSource {
    fn origin_id(&self) -> &str {
        &self.origin_id
    }

    fn fetch(&self, after: u64, limit: usize, block: Duration) -> BoxFuture<'_, SourceBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let origin_id = self.origin_id.clone();
            return Box::pin(async move {
                Err(GlobalSyncError::SourceConnection {
                    origin_id,
                    message: "connection reset by peer".into(),
                })
            });
        }

        let trimmed = *self.trimmed_through.lock().unwrap();
        let batch = if after < trimmed {
            SourceBatch::Trimmed {
                requested: after,
                oldest: trimmed + 1,
            }
        } else {
            SourceBatch::Operations(
                self.ops
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|o| o.origin_seq > after)
                    .take(limit)
                    .cloned()
                    .collect(),
            )
        };

        Box::pin(async move {
            if batch == SourceBatch::Operations(Vec::new()) {
                tokio::time::sleep(block).await;
            }
            Ok(batch)
        })
    }
}

/// An update with a distinct timestamp per sequence.
pub fn update(origin_seq: u64, namespace: &Namespace, key: &str) -> LocalOperation {
    let mut patch = Fields::new();
    patch.insert("seq".to_string(), serde_json::json!(origin_seq));
    LocalOperation {
        origin_seq,
        op_kind: OpKind::Update,
        namespace: namespace.clone(),
        document_key: DocumentKey::from(key),
        patch,
        origin_timestamp: 1_000 + origin_seq,
        observed: VectorTime::new(),
    }
}
