// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global Applier.
//!
//! One Applier per destination. It reads the global log after its
//! checkpoint and replays each batch into the destination store. The
//! checkpoint lives in the destination store and commits in the same
//! transaction as the batch, so a crash anywhere leaves effect and
//! checkpoint consistent.
//!
//! ```text
//! GOL.read_batch(position) ──▶ ReplayBatch ──▶ StoreCircuit.replay
//!                                                  │
//!                                                  ▼
//!                               DocumentStore::replay_batch (one tx)
//!                                   documents + conflicts + checkpoint
//!                                                  │
//!                                                  ▼
//!                               GOL.confirm(position)  (enables retention)
//! ```
//!
//! The GOL confirmation trails the checkpoint. Losing it only delays
//! retention; the next batch confirms again.

use crate::batch::{BatchConfig, ReplayBatch, ReplayReport};
use crate::circuit_breaker::{CircuitError, StoreCircuit};
use crate::config::{ApplierConfig, ResumeFrom, SloConfig};
use crate::coordinator::{LinkHandle, LinkRole};
use crate::error::{GlobalSyncError, Result};
use crate::log::{GlobalLog, LogRead};
use crate::metrics;
use crate::store::DocumentStore;
use crate::tailer::wait_or_shutdown;
use crate::topology::Topology;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub struct GlobalApplier {
    destination_id: String,
    log: Arc<GlobalLog>,
    store: Arc<DocumentStore>,
    topology: Arc<Topology>,
    circuit: Arc<StoreCircuit>,
    batch: BatchConfig,
    config: ApplierConfig,
    slo: SloConfig,
    link: LinkHandle,
    position: u64,
    confirmed: u64,
    started: bool,
}

impl GlobalApplier {
    pub fn new(
        destination_id: &str,
        log: Arc<GlobalLog>,
        store: Arc<DocumentStore>,
        topology: Arc<Topology>,
        config: ApplierConfig,
    ) -> Self {
        Self {
            destination_id: destination_id.to_string(),
            log,
            store,
            topology,
            circuit: Arc::new(StoreCircuit::new()),
            batch: BatchConfig::from_applier(&config),
            config,
            slo: SloConfig::default(),
            link: LinkHandle::detached(LinkRole::Applier, destination_id),
            position: 0,
            confirmed: 0,
            started: false,
        }
    }

    pub fn with_circuit(mut self, circuit: Arc<StoreCircuit>) -> Self {
        self.circuit = circuit;
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

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Last `global_seq` committed to the destination.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Resolve the checkpoint and register with the log for retention.
    ///
    /// Fails with a fatal error, instead of guessing, when:
    /// - the store has no checkpoint but the log has a confirmed position
    ///   for this destination (lost checkpoint);
    /// - the checkpoint is ahead of the log head (corrupt checkpoint);
    /// - the log already reclaimed records after the checkpoint.
    #[instrument(skip(self), fields(destination_id = %self.destination_id))]
    pub async fn start(&mut self, resume_from: ResumeFrom) -> Result<u64> {
        let link = self.link.name().to_string();

        let position = match resume_from {
            ResumeFrom::Checkpoint => {
                let stored = self.store.applier_position(&self.destination_id).await?;
                let confirmed = self.log.consumer_position(&self.destination_id).await?;
                match (stored, confirmed) {
                    (Some(p), _) => p,
                    (None, Some(c)) => {
                        return Err(GlobalSyncError::resume(
                            link,
                            format!(
                                "no checkpoint in the destination store but the global log has confirmed position {}; resync required",
                                c
                            ),
                        ));
                    }
                    (None, None) => 0,
                }
            }
            ResumeFrom::Beginning => {
                warn!("Resynchronizing applier from the beginning of the global log");
                self.store.set_applier_position(&self.destination_id, 0).await?;
                0
            }
            ResumeFrom::Position(n) => {
                warn!(position = n, "Resynchronizing applier from operator-supplied position");
                self.store.set_applier_position(&self.destination_id, n).await?;
                n
            }
        };

        let head = self.log.head();
        if position > head {
            return Err(GlobalSyncError::resume(
                link,
                format!(
                    "checkpoint {} is ahead of the global log head {}; refusing to guess",
                    position, head
                ),
            ));
        }
        let low_water_mark = self.log.low_water_mark().await?;
        if position < low_water_mark {
            return Err(GlobalSyncError::LogTrimmed {
                destination_id: self.destination_id.clone(),
                requested: position,
                oldest: low_water_mark + 1,
            });
        }

        self.log
            .register_consumer(&self.destination_id, position)
            .await?;
        self.position = position;
        self.confirmed = position;
        self.started = true;
        self.link.set_position(position);
        metrics::set_applier_position(&self.destination_id, position);
        info!(position, head, "Applier resuming");
        Ok(position)
    }

    /// Replay one batch. An empty report means the Applier is caught up.
    pub async fn apply_once(&mut self) -> Result<ReplayReport> {
        if !self.started {
            return Err(GlobalSyncError::InvalidState {
                expected: "started".into(),
                actual: "not started".into(),
            });
        }

        let records = match self
            .log
            .read_batch(self.position, self.batch.max_records)
            .await?
        {
            LogRead::Records(records) => records,
            LogRead::Trimmed { requested, oldest } => {
                return Err(GlobalSyncError::LogTrimmed {
                    destination_id: self.destination_id.clone(),
                    requested,
                    oldest,
                });
            }
        };

        if records.is_empty() {
            self.confirm().await?;
            return Ok(ReplayReport {
                last_position: self.position,
                ..Default::default()
            });
        }

        let batch = ReplayBatch::new(records)?;
        let report = self.replay(&batch).await?;

        self.position = report.last_position;
        self.link.set_position(self.position);
        metrics::set_applier_position(&self.destination_id, self.position);
        self.confirm().await?;
        self.report_lag();
        Ok(report)
    }

    #[instrument(skip(self, batch), fields(destination_id = %self.destination_id, first = ?batch.first_position(), last = ?batch.last_position()))]
    async fn replay(&self, batch: &ReplayBatch) -> Result<ReplayReport> {
        let started = Instant::now();
        let store = &self.store;
        let topology = &self.topology;
        let destination_id = self.destination_id.as_str();

        let report = self
            .circuit
            .replay
            .call(|| store.replay_batch(destination_id, batch.records(), topology))
            .await
            .map_err(|e| match e {
                CircuitError::Rejected => {
                    GlobalSyncError::CircuitOpen(self.circuit.replay.name().into())
                }
                CircuitError::Inner(e) => e,
            })?;

        let elapsed = started.elapsed();
        metrics::record_replay_batch(
            destination_id,
            report.total,
            report.applied,
            report.skipped(),
            report.conflicts,
            elapsed,
        );
        if self.slo.is_batch_apply_violation(elapsed) {
            warn!(
                latency_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slo.max_batch_apply_latency_ms,
                records = report.total,
                "Replay batch latency above SLO"
            );
            metrics::record_slo_violation(
                self.link.name(),
                "batch_apply",
                elapsed.as_millis() as u64,
            );
        }
        if !report.is_success() {
            warn!(?report, "Replay report does not account for every record");
        }

        debug!(
            applied = report.applied,
            conflicts = report.conflicts,
            skipped_own = report.skipped_own,
            skipped_replayed = report.skipped_replayed,
            position = report.last_position,
            "Batch replayed"
        );
        Ok(report)
    }

    async fn confirm(&mut self) -> Result<()> {
        if self.position > self.confirmed {
            self.log.confirm(&self.destination_id, self.position).await?;
            self.confirmed = self.position;
        }
        Ok(())
    }

    fn report_lag(&self) {
        let lag = self.log.head().saturating_sub(self.position);
        metrics::set_applier_lag(&self.destination_id, lag);
        if self.slo.is_lag_violation(lag) {
            warn!(
                lag_records = lag,
                threshold = self.slo.max_apply_lag_records,
                "Applier lag above SLO"
            );
            metrics::record_slo_violation(self.link.name(), "apply_lag", lag);
        }
    }

    /// Replay until shutdown or a non-retryable error.
    ///
    /// Waits on the log head while caught up. Shutdown is checked between
    /// batches only, so a batch always commits or is retried whole.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut consecutive_failures = 0u32;
        let idle_wait = self.batch.idle_wait;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.apply_once().await {
                Ok(report) => {
                    consecutive_failures = 0;
                    if report.total == 0 {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = self.log.wait_for_append(self.position, idle_wait) => {}
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = self.config.backoff_for_failures(consecutive_failures);
                    warn!(
                        error = %e,
                        consecutive_failures,
                        backoff_ms = delay.as_millis() as u64,
                        "Replay failed; retrying the same batch"
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
                            "Applier halted; resynchronize this destination (resume from Beginning or a known Position)"
                        );
                    } else {
                        error!(error = %e, position = self.position, "Applier halted");
                    }
                    return Err(e);
                }
            }
        }

        info!(position = self.position, "Applier stopped");
        Ok(())
    }
}

impl std::fmt::Debug for GlobalApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalApplier")
            .field("destination_id", &self.destination_id)
            .field("position", &self.position)
            .field("started", &self.started)
            .finish()
    }
}
