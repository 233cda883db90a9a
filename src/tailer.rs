// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source Tailer.
//!
//! One Tailer per origin. It reads the origin's local operation stream from
//! its resume position, turns each operation into an [`OperationRecord`] and
//! appends it to the global log, then commits its cursor.
//!
//! ```text
//! origin stream ──fetch(after, limit, block)──▶ contiguity check
//!                                                   │
//!                       non-global ns ◀─────────────┤
//!                  (advance_origin only)            ▼
//!                                             GOL append (sequential)
//!                                                   │
//!                                                   ▼
//!                                             cursor commit
//! ```
//!
//! # Failure handling
//!
//! - Transient errors (Redis, SQLite busy, open circuit): back off and
//!   re-fetch from the same position. Re-appended operations are discarded
//!   by the log as duplicates.
//! - A gap in `origin_seq`, or a stream trimmed past the position, is fatal:
//!   the Tailer stops and the operator must resynchronize.
//! - Shutdown is honored while waiting on the origin, never mid-batch.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::config::{ResumeFrom, SloConfig, TailerConfig};
use crate::coordinator::{LinkHandle, LinkRole};
use crate::cursor::{check_cursor_against_watermark, CursorStore};
use crate::error::{GlobalSyncError, Result};
use crate::log::{AppendOutcome, GlobalLog};
use crate::metrics;
use crate::record::{LocalOperation, OperationRecord};
use crate::resilience::RateLimiter;
use crate::source::{OperationSource, SourceBatch};
use crate::topology::Topology;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What one `tail_once` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailReport {
    pub fetched: usize,
    pub appended: usize,
    pub duplicates: usize,
    /// Operations on non-global namespaces.
    pub filtered: usize,
    /// Last `origin_seq` consumed.
    pub position: u64,
}

pub struct SourceTailer {
    origin_id: String,
    source: Arc<dyn OperationSource>,
    log: Arc<GlobalLog>,
    cursors: Arc<CursorStore>,
    topology: Arc<Topology>,
    config: TailerConfig,
    slo: SloConfig,
    circuit: CircuitBreaker,
    rate_limiter: Option<Arc<RateLimiter>>,
    link: LinkHandle,
    position: u64,
    started: bool,
}

impl SourceTailer {
    pub fn new(
        source: Arc<dyn OperationSource>,
        log: Arc<GlobalLog>,
        cursors: Arc<CursorStore>,
        topology: Arc<Topology>,
        config: TailerConfig,
    ) -> Self {
        let origin_id = source.origin_id().to_string();
        Self {
            circuit: CircuitBreaker::new(format!("source:{}", origin_id), CircuitConfig::default()),
            link: LinkHandle::detached(LinkRole::Tailer, &origin_id),
            origin_id,
            source,
            log,
            cursors,
            topology,
            config,
            slo: SloConfig::default(),
            rate_limiter: None,
            position: 0,
            started: false,
        }
    }

    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new(format!("source:{}", self.origin_id), config);
        self
    }

    /// Share a limiter across Tailers to pace reconnect storms.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    pub(crate) fn with_link(mut self, link: LinkHandle) -> Self {
        self.link = link;
        self
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Last `origin_seq` consumed.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Resolve the resume position. Refuses to guess.
    ///
    /// | `resume_from` | cursor | GOL watermark | result |
    /// |---|---|---|---|
    /// | `Checkpoint` | `c` | `w >= c` | resume at `c` |
    /// | `Checkpoint` | `c` | `w < c` or none | fatal (corrupt cursor) |
    /// | `Checkpoint` | none | `w > 0` | fatal (lost cursor) |
    /// | `Checkpoint` | none | none | start at 0 |
    /// | `Beginning` | any | any | cursor rewritten to 0 |
    /// | `Position(n)` | any | any | cursor rewritten to `n` |
    #[instrument(skip(self), fields(origin_id = %self.origin_id))]
    pub async fn start(&mut self, resume_from: ResumeFrom) -> Result<u64> {
        let watermark = self.log.origin_watermark(&self.origin_id).await;

        let position = match resume_from {
            ResumeFrom::Checkpoint => match self.cursors.get(&self.origin_id).await {
                Some(cursor) => {
                    check_cursor_against_watermark(&self.origin_id, cursor, watermark)?;
                    cursor
                }
                None => match watermark {
                    Some(w) if w > 0 => {
                        return Err(GlobalSyncError::resume(
                            self.link.name(),
                            format!(
                                "no cursor stored but the global log already holds operations through origin_seq {}; resync from a known position",
                                w
                            ),
                        ));
                    }
                    _ => 0,
                },
            },
            ResumeFrom::Beginning => {
                warn!("Resynchronizing tailer from the beginning of the origin stream");
                self.cursors.commit(&self.origin_id, 0).await?;
                0
            }
            ResumeFrom::Position(n) => {
                warn!(position = n, "Resynchronizing tailer from operator-supplied position");
                // The operator accepts that nothing up to `n` is tailed.
                if watermark.unwrap_or(0) < n {
                    self.log.advance_origin(&self.origin_id, n).await?;
                }
                self.cursors.commit(&self.origin_id, n).await?;
                n
            }
        };

        self.position = position;
        self.started = true;
        self.link.set_position(position);
        metrics::set_tailer_position(&self.origin_id, position);
        info!(position, ?watermark, "Tailer resuming");
        Ok(position)
    }

    /// Fetch and process one batch.
    pub async fn tail_once(&mut self) -> Result<TailReport> {
        let batch = self.fetch_batch().await?;
        self.process(batch).await
    }

    async fn fetch_batch(&self) -> Result<SourceBatch> {
        if !self.started {
            return Err(GlobalSyncError::InvalidState {
                expected: "started".into(),
                actual: "not started".into(),
            });
        }

        let started = Instant::now();
        let source = &self.source;
        let (after, limit) = (self.position, self.config.batch_size.max(1));
        let block = self.config.block_timeout_duration();

        let batch = self
            .circuit
            .call(|| source.fetch(after, limit, block))
            .await
            .map_err(|e| match e {
                CircuitError::Rejected => GlobalSyncError::CircuitOpen(self.circuit.name().into()),
                CircuitError::Inner(e) => e,
            })?;

        let elapsed = started.elapsed();
        if let SourceBatch::Operations(ops) = &batch {
            metrics::record_source_read(&self.origin_id, ops.len(), elapsed);
            // An empty batch spent its time blocking, not reading.
            if !ops.is_empty() && self.slo.is_source_read_violation(elapsed) {
                warn!(
                    latency_ms = elapsed.as_millis() as u64,
                    threshold_ms = self.slo.max_source_read_latency_ms,
                    "Source read latency above SLO"
                );
                metrics::record_slo_violation(
                    self.link.name(),
                    "source_read",
                    elapsed.as_millis() as u64,
                );
            }
        }
        Ok(batch)
    }

    async fn process(&mut self, batch: SourceBatch) -> Result<TailReport> {
        let ops = match batch {
            SourceBatch::Operations(ops) => ops,
            SourceBatch::Trimmed { requested, oldest } => {
                metrics::record_sequence_gap(&self.origin_id);
                return Err(GlobalSyncError::SequenceGap {
                    origin_id: self.origin_id.clone(),
                    expected: requested + 1,
                    found: oldest,
                });
            }
        };

        let mut report = TailReport {
            fetched: ops.len(),
            position: self.position,
            ..Default::default()
        };
        if ops.is_empty() {
            return Ok(report);
        }

        let started = Instant::now();
        let mut position = self.position;
        // Filtered run the log has not been told about yet.
        let mut unannounced: Option<u64> = None;

        for op in ops {
            if op.origin_seq != position + 1 {
                metrics::record_sequence_gap(&self.origin_id);
                return Err(GlobalSyncError::SequenceGap {
                    origin_id: self.origin_id.clone(),
                    expected: position + 1,
                    found: op.origin_seq,
                });
            }

            if !self.topology.is_global(&op.namespace) {
                report.filtered += 1;
                position = op.origin_seq;
                unannounced = Some(position);
                continue;
            }

            if let Some(through) = unannounced.take() {
                self.log.advance_origin(&self.origin_id, through).await?;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            position = op.origin_seq;
            match self.append(op).await? {
                AppendOutcome::Appended(_) => report.appended += 1,
                AppendOutcome::Duplicate(_) => report.duplicates += 1,
            }
        }
        if let Some(through) = unannounced {
            self.log.advance_origin(&self.origin_id, through).await?;
        }

        self.position = position;
        report.position = position;

        self.cursors.commit(&self.origin_id, position).await?;

        self.link.set_position(position);
        metrics::set_tailer_position(&self.origin_id, position);
        metrics::record_tailer_batch(
            &self.origin_id,
            report.appended,
            report.duplicates,
            report.filtered,
            started.elapsed(),
        );
        debug!(
            appended = report.appended,
            duplicates = report.duplicates,
            filtered = report.filtered,
            position,
            "Tailed batch"
        );
        Ok(report)
    }

    async fn append(&self, op: LocalOperation) -> Result<AppendOutcome> {
        let record = OperationRecord::from_local(&self.origin_id, op);
        let outcome = self.log.append(&record).await?;
        if let AppendOutcome::Duplicate(existing) = outcome {
            debug!(
                origin_seq = record.origin_seq,
                existing, "Operation already in the global log"
            );
        }
        Ok(outcome)
    }

    /// Tail until shutdown or a non-retryable error.
    ///
    /// Returns `Ok(())` on shutdown. Errors returned here halt the link.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.fetch_batch() => batch,
            };
            let result = match fetched {
                Ok(batch) => self.process(batch).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => consecutive_failures = 0,
                Err(e) if e.is_retryable() => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.config.backoff_for_failures(consecutive_failures);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        backoff_ms = delay.as_millis() as u64,
                        "Tailer batch failed; retrying from the same position"
                    );
                    self.link.record_transient(&e, consecutive_failures);
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(
                            error = %e,
                            position = self.position,
                            "Tailer halted; resynchronize this origin (resume from Beginning or a known Position)"
                        );
                    } else {
                        error!(error = %e, position = self.position, "Tailer halted");
                    }
                    return Err(e);
                }
            }
        }

        info!(position = self.position, "Tailer stopped");
        Ok(())
    }
}

impl std::fmt::Debug for SourceTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTailer")
            .field("origin_id", &self.origin_id)
            .field("position", &self.position)
            .field("started", &self.started)
            .finish()
    }
}

/// Sleep for `delay`. Returns true if shutdown was signaled meanwhile.
pub(crate) async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Granularity;
    use crate::log::LogRead;
    use crate::record::{DocumentKey, Fields, Namespace, OpKind, Stamp, VectorTime};
    use crate::source::BoxFuture;
    use crate::store::DocumentStore;
    use std::sync::Mutex as StdMutex;

    fn orders() -> Namespace {
        Namespace::new("shop.orders").unwrap()
    }

    fn op(origin_seq: u64, namespace: &Namespace) -> LocalOperation {
        LocalOperation {
            origin_seq,
            op_kind: OpKind::Update,
            namespace: namespace.clone(),
            document_key: DocumentKey::from(format!("k{}", origin_seq)),
            patch: Fields::new(),
            origin_timestamp: origin_seq * 10,
            observed: VectorTime::new(),
        }
    }

    /// Scripted origin that serves a fixed operation list.
    struct ScriptedSource {
        origin_id: String,
        ops: StdMutex<Vec<LocalOperation>>,
        trimmed_through: StdMutex<u64>,
    }

    impl ScriptedSource {
        fn new(origin_id: &str, ops: Vec<LocalOperation>) -> Self {
            Self {
                origin_id: origin_id.into(),
                ops: StdMutex::new(ops),
                trimmed_through: StdMutex::new(0),
            }
        }
    }

    impl OperationSource for ScriptedSource {
        fn origin_id(&self) -> &str {
            &self.origin_id
        }

        fn fetch(&self, after: u64, limit: usize, block: Duration) -> BoxFuture<'_, SourceBatch> {
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
                if batch == SourceBatch::Operations(vec![]) {
                    tokio::time::sleep(block).await;
                }
                Ok(batch)
            })
        }
    }

    async fn fixtures() -> (Arc<GlobalLog>, Arc<CursorStore>, Arc<Topology>) {
        let log = Arc::new(GlobalLog::open(":memory:", 0).await.unwrap());
        let cursors = Arc::new(CursorStore::new(":memory:").await.unwrap());
        let topology = Arc::new(Topology::new());
        topology.mark_global(orders(), Granularity::Document);
        (log, cursors, topology)
    }

    fn config() -> TailerConfig {
        TailerConfig {
            batch_size: 4,
            block_timeout: "10ms".into(),
            ..Default::default()
        }
    }

    async fn records(log: &GlobalLog) -> Vec<OperationRecord> {
        match log.read_batch(0, 100).await.unwrap() {
            LogRead::Records(r) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tails_in_origin_order_and_commits_cursor() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            (1..=6).map(|i| op(i, &orders())).collect(),
        ));
        let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, config());

        assert_eq!(tailer.start(ResumeFrom::Checkpoint).await.unwrap(), 0);
        let first = tailer.tail_once().await.unwrap();
        assert_eq!(first.appended, 4);
        assert_eq!(first.position, 4);
        let second = tailer.tail_once().await.unwrap();
        assert_eq!(second.appended, 2);

        let seqs: Vec<u64> = records(&log).await.iter().map(|r| r.origin_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(cursors.get("rs-a").await, Some(6));

        let idle = tailer.tail_once().await.unwrap();
        assert_eq!(idle, TailReport { position: 6, ..Default::default() });
    }

    #[tokio::test]
    async fn test_non_global_operations_are_filtered() {
        let (log, cursors, topology) = fixtures().await;
        let local_ns = Namespace::new("shop.sessions").unwrap();
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            vec![op(1, &local_ns), op(2, &local_ns), op(3, &orders()), op(4, &local_ns)],
        ));
        let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();

        let report = tailer.tail_once().await.unwrap();
        assert_eq!(report.filtered, 3);
        assert_eq!(report.appended, 1);
        assert_eq!(records(&log).await[0].origin_seq, 3);
        assert_eq!(log.origin_watermark("rs-a").await, Some(4));
        assert_eq!(cursors.get("rs-a").await, Some(4));
    }

    #[tokio::test]
    async fn test_crash_before_cursor_commit_discards_duplicates() {
        let (log, cursors, topology) = fixtures().await;
        let ops: Vec<LocalOperation> = (1..=10).map(|i| op(i, &orders())).collect();

        // Five of ten appended, cursor never committed.
        for o in &ops[..5] {
            log.append(&OperationRecord::from_local("rs-a", o.clone()))
                .await
                .unwrap();
        }

        let source = Arc::new(ScriptedSource::new("rs-a", ops));
        let mut tailer = SourceTailer::new(
            source,
            log.clone(),
            cursors.clone(),
            topology,
            TailerConfig {
                batch_size: 10,
                ..config()
            },
        );
        // The cursor is missing while the log holds this origin's records.
        let err = tailer.start(ResumeFrom::Checkpoint).await.unwrap_err();
        assert!(err.is_fatal());

        cursors.commit("rs-a", 0).await.unwrap();
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();
        let report = tailer.tail_once().await.unwrap();
        assert_eq!(report.duplicates, 5);
        assert_eq!(report.appended, 5);

        let all = records(&log).await;
        assert_eq!(all.len(), 10);
        let global: Vec<u64> = all.iter().map(|r| r.global_seq).collect();
        assert_eq!(global, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_gap_in_stream_is_fatal() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            vec![op(1, &orders()), op(2, &orders()), op(5, &orders())],
        ));
        let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();

        let err = tailer.tail_once().await.unwrap_err();
        assert!(matches!(
            err,
            GlobalSyncError::SequenceGap { expected: 3, found: 5, .. }
        ));
        // Nothing past the gap was committed.
        assert_eq!(cursors.get("rs-a").await, None);
        assert_eq!(tailer.position(), 0);
    }

    #[tokio::test]
    async fn test_repeated_origin_timestamp_halts_the_link() {
        let (log, cursors, topology) = fixtures().await;
        let mut first = op(1, &orders());
        first.document_key = DocumentKey::from("doc");
        first.op_kind = OpKind::Insert;
        first.origin_timestamp = 1_000;
        let mut second = op(2, &orders());
        second.document_key = DocumentKey::from("doc");
        second.origin_timestamp = 1_000;
        second.observed.advance(&Stamp::new("redis-origin", 1_000));

        let source = Arc::new(ScriptedSource::new("redis-origin", vec![first, second]));
        let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();

        let err = tailer.tail_once().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            GlobalSyncError::TimestampRegression { origin_seq: 2, found: 1_000, .. }
        ));
        assert_eq!(records(&log).await.len(), 1);
        assert_eq!(cursors.get("redis-origin").await, None);

        // Retrying never lets the second write through as a silent no-op.
        let err = tailer.tail_once().await.unwrap_err();
        assert!(matches!(err, GlobalSyncError::TimestampRegression { .. }));
        assert_eq!(log.head(), 1);
    }

    #[tokio::test]
    async fn test_trimmed_stream_is_gap() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            (4..=6).map(|i| op(i, &orders())).collect(),
        ));
        *source.trimmed_through.lock().unwrap() = 3;
        let mut tailer = SourceTailer::new(source, log, cursors, topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();

        let err = tailer.tail_once().await.unwrap_err();
        assert!(matches!(
            err,
            GlobalSyncError::SequenceGap { expected: 1, found: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_operator_position_skips_trimmed_prefix() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            (4..=6).map(|i| op(i, &orders())).collect(),
        ));
        *source.trimmed_through.lock().unwrap() = 3;
        let mut tailer = SourceTailer::new(source, log.clone(), cursors.clone(), topology, config());

        assert_eq!(tailer.start(ResumeFrom::Position(3)).await.unwrap(), 3);
        let report = tailer.tail_once().await.unwrap();
        assert_eq!(report.appended, 3);
        assert_eq!(cursors.get("rs-a").await, Some(6));
    }

    #[tokio::test]
    async fn test_cursor_ahead_of_log_is_rejected() {
        let (log, cursors, topology) = fixtures().await;
        cursors.commit("rs-a", 12).await.unwrap();
        let source = Arc::new(ScriptedSource::new("rs-a", vec![]));
        let mut tailer = SourceTailer::new(source, log, cursors, topology, config());

        let err = tailer.start(ResumeFrom::Checkpoint).await.unwrap_err();
        assert!(matches!(err, GlobalSyncError::ResumePosition { .. }));
    }

    #[tokio::test]
    async fn test_tail_before_start_is_rejected() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new("rs-a", vec![op(1, &orders())]));
        let mut tailer = SourceTailer::new(source, log, cursors, topology, config());
        assert!(matches!(
            tailer.tail_once().await.unwrap_err(),
            GlobalSyncError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_tails_local_store_stream() {
        let (log, cursors, topology) = fixtures().await;
        let store = Arc::new(DocumentStore::open("rs-a", ":memory:", false).await.unwrap());
        store
            .insert(&orders(), &DocumentKey::from("o1"), Fields::new())
            .await
            .unwrap();
        store
            .delete(&orders(), &DocumentKey::from("o1"))
            .await
            .unwrap();

        let mut tailer = SourceTailer::new(store, log.clone(), cursors, topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();
        let report = tailer.tail_once().await.unwrap();
        assert_eq!(report.appended, 2);

        let kinds: Vec<OpKind> = records(&log).await.iter().map(|r| r.op_kind).collect();
        assert_eq!(kinds, vec![OpKind::Insert, OpKind::Delete]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_on_gap() {
        let (log, cursors, topology) = fixtures().await;
        let source = Arc::new(ScriptedSource::new(
            "rs-a",
            (1..=3).map(|i| op(i, &orders())).collect(),
        ));
        let mut tailer = SourceTailer::new(
            source.clone(),
            log.clone(),
            cursors.clone(),
            topology.clone(),
            config(),
        );
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let result = tailer.run(rx).await;
            (tailer, result)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let (tailer, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(tailer.position(), 3);

        // A gap halts `run` with the fatal error.
        source.ops.lock().unwrap().push(op(9, &orders()));
        let mut tailer = SourceTailer::new(source, log, cursors, topology, config());
        tailer.start(ResumeFrom::Checkpoint).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let err = tailer.run(rx).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
