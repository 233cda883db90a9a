//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup and origin-stream publishing
//! - A scripted in-memory origin stream
//! - `TestSite`: one origin/destination with its tailer and applier,
//!   stepped by hand so scenarios control exactly who has seen what

#![allow(dead_code)]

pub mod containers;
pub mod mock_source;

pub use containers::*;
pub use mock_source::*;

use global_sync::{
    ApplierConfig, CursorStore, DocumentKey, DocumentStore, Fields, GlobalApplier, GlobalLog,
    Granularity, LogRead, Namespace, OperationRecord, ReplayReport, ResumeFrom, SourceTailer,
    TailerConfig, Topology,
};
use std::sync::Arc;
use std::time::Duration;

pub fn orders() -> Namespace {
    Namespace::new("shop.orders").unwrap()
}

pub fn key(k: &str) -> DocumentKey {
    DocumentKey::from(k)
}

/// Build a field map from `(name, value)` pairs.
pub fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub async fn shared_log() -> Arc<GlobalLog> {
    Arc::new(GlobalLog::open(":memory:", 0).await.unwrap())
}

pub fn topology(granularity: Granularity) -> Arc<Topology> {
    let topology = Topology::new();
    topology.mark_global(orders(), granularity);
    Arc::new(topology)
}

pub fn tailer_config() -> TailerConfig {
    TailerConfig {
        batch_size: 8,
        block_timeout: "5ms".into(),
        backoff_base_ms: 5,
        backoff_max_ms: 50,
        ..Default::default()
    }
}

pub fn applier_config() -> ApplierConfig {
    ApplierConfig {
        batch_size: 8,
        idle_wait: "10ms".into(),
        backoff_base_ms: 5,
        backoff_max_ms: 50,
        ..Default::default()
    }
}

/// Every record currently in the log.
pub async fn all_records(log: &GlobalLog) -> Vec<OperationRecord> {
    match log.read_batch(0, 10_000).await.unwrap() {
        LogRead::Records(records) => records,
        other => panic!("unexpected log read: {:?}", other),
    }
}

/// A node acting as both origin and destination, driven step by step.
pub struct TestSite {
    pub id: String,
    pub store: Arc<DocumentStore>,
    pub cursors: Arc<CursorStore>,
    pub tailer: SourceTailer,
    pub applier: GlobalApplier,
}

impl TestSite {
    pub async fn new(id: &str, log: &Arc<GlobalLog>, topology: &Arc<Topology>) -> Self {
        let store = Arc::new(DocumentStore::open(id, ":memory:", false).await.unwrap());
        Self::with_store(store, log, topology).await
    }

    pub async fn with_store(
        store: Arc<DocumentStore>,
        log: &Arc<GlobalLog>,
        topology: &Arc<Topology>,
    ) -> Self {
        let id = store.origin_id().to_string();
        let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
        let mut tailer = SourceTailer::new(
            store.clone(),
            log.clone(),
            cursors.clone(),
            topology.clone(),
            tailer_config(),
        );
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();
        let mut applier = GlobalApplier::new(
            &id,
            log.clone(),
            store.clone(),
            topology.clone(),
            applier_config(),
        );
        applier.start(ResumeFrom::Checkpoint).await.unwrap();
        Self {
            id,
            store,
            cursors,
            tailer,
            applier,
        }
    }

    /// Tail the local stream into the log until caught up.
    pub async fn publish(&mut self) -> usize {
        let mut appended = 0;
        loop {
            let report = self.tailer.tail_once().await.unwrap();
            appended += report.appended;
            if report.fetched == 0 {
                return appended;
            }
        }
    }

    /// Replay the log into the local store until caught up.
    pub async fn catch_up(&mut self) -> ReplayReport {
        let mut total = ReplayReport::default();
        loop {
            let report = self.applier.apply_once().await.unwrap();
            if report.total == 0 {
                total.last_position = report.last_position;
                return total;
            }
            total.total += report.total;
            total.applied += report.applied;
            total.noop += report.noop;
            total.already_applied += report.already_applied;
            total.skipped_own += report.skipped_own;
            total.skipped_replayed += report.skipped_replayed;
            total.conflicts += report.conflicts;
            total.anomalies += report.anomalies;
        }
    }

    pub async fn doc(&self, k: &str) -> Option<Fields> {
        self.store.get(&orders(), &key(k)).await.unwrap()
    }

    pub async fn contents(&self) -> Vec<(DocumentKey, Fields)> {
        self.store.list(&orders()).await.unwrap()
    }
}

/// Publish and replay on every site until nothing moves.
pub async fn quiesce(sites: &mut [TestSite]) {
    for _ in 0..100 {
        let mut moved = 0;
        for site in sites.iter_mut() {
            moved += site.publish().await;
        }
        for site in sites.iter_mut() {
            moved += site.catch_up().await.total;
        }
        if moved == 0 {
            return;
        }
    }
    panic!("sites did not quiesce");
}

/// Poll `check` until it holds or the timeout passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
