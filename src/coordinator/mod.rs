// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global sync node.
//!
//! The orchestrator that composes a node's independent roles:
//! - one Tailer per origin stream ([`crate::tailer::SourceTailer`]): the
//!   node's own local operation stream plus any configured Redis origins
//! - at most one Applier ([`crate::applier::GlobalApplier`]) replaying the
//!   shared global log into the node's [`DocumentStore`]
//! - a retention task reclaiming confirmed GOL records
//!
//! # Architecture
//!
//! ```text
//!   local writes ──▶ DocumentStore ──local stream──▶ Tailer ─┐
//!   Redis origin ──────────────────────────────────▶ Tailer ─┤
//!                                                            ▼
//!                                                   GlobalLog (shared)
//!                                                            │
//!                     DocumentStore ◀── Applier ◀────────────┘
//! ```
//!
//! Every role runs as its own task with its own shutdown channel, so an
//! operator can resync one link without touching the others. A link that
//! hits a fatal error stops and reports `Failed` through
//! [`health_check()`](GlobalSyncNode::health_check); the node stays `Running`.

mod apply_path;
mod tail_path;
mod types;

pub use types::{EngineState, HealthCheck, LinkHandle, LinkHealth, LinkRole, LinkState};
pub(crate) use types::LinkRegistry;

use crate::applier::GlobalApplier;
use crate::circuit_breaker::{CircuitConfig, StoreCircuit};
use crate::config::{GlobalSyncConfig, ResumeFrom, SourceConfig, SourceKind};
use crate::conflict::Granularity;
use crate::conflicts_log::ConflictRecord;
use crate::cursor::CursorStore;
use crate::error::{GlobalSyncError, Result};
use crate::log::GlobalLog;
use crate::metrics;
use crate::record::Namespace;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::source::redis::RedisSource;
use crate::source::OperationSource;
use crate::store::DocumentStore;
use crate::tailer::SourceTailer;
use crate::topology::Topology;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each worker to finish its current batch.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const RETENTION_WORKER: &str = "retention";

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A node in the global sync topology.
pub struct GlobalSyncNode {
    config: GlobalSyncConfig,

    /// Shared by every node in the deployment.
    log: Arc<GlobalLog>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Opened in `start()`.
    store: Option<Arc<DocumentStore>>,
    cursors: Option<Arc<CursorStore>>,

    topology: Arc<Topology>,
    circuit: Arc<StoreCircuit>,

    /// Shared across all tailers on the node.
    rate_limiter: Option<Arc<RateLimiter>>,

    links: LinkRegistry,

    /// Running tasks keyed by link name.
    workers: DashMap<String, Worker>,
}

impl GlobalSyncNode {
    /// Create a node over an already-open global log.
    ///
    /// The node starts in `Created` state. Call [`start()`](Self::start)
    /// to open the store and spawn its links.
    pub fn new(config: GlobalSyncConfig, log: Arc<GlobalLog>) -> Result<Self> {
        config.validate()?;
        let topology = Topology::from_config(&config)?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let rate_limiter = config.settings.tailer.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.per_second,
                burst = cfg.burst,
                "Rate limiting enabled for tailers"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        Ok(Self {
            config,
            log,
            state_tx,
            state_rx,
            store: None,
            cursors: None,
            topology: Arc::new(topology),
            circuit: Arc::new(StoreCircuit::new()),
            rate_limiter,
            links: LinkRegistry::default(),
            workers: DashMap::new(),
        })
    }

    /// Open the global log named in the config and create a node over it.
    pub async fn open(config: GlobalSyncConfig) -> Result<Self> {
        let log = GlobalLog::open(
            &config.log.sqlite_path,
            config.settings.retention.max_records,
        )
        .await?;
        Self::new(config, Arc::new(log))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn log(&self) -> &Arc<GlobalLog> {
        &self.log
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// The node's document store. `None` until started.
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Health of the node and every link.
    ///
    /// Reads in-memory state only.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let mut links: Vec<LinkHealth> = self.links.iter().map(|e| e.value().clone()).collect();
        links.sort_by(|a, b| a.link.cmp(&b.link));

        let links_total = links.len();
        let links_running = links
            .iter()
            .filter(|l| l.state == LinkState::Running)
            .count();
        let links_failed = links.iter().filter(|l| l.state.is_failed()).count();

        let running = state == EngineState::Running;
        HealthCheck {
            state,
            ready: running && links_total > 0 && links_running == links_total,
            healthy: running && links_failed == 0,
            gol_head: self.log.head(),
            links_total,
            links_running,
            links_failed,
            links,
        }
    }

    /// Start the node.
    ///
    /// 1. Opens the document store and cursor store (SQLite)
    /// 2. Spawns a Tailer per configured source
    /// 3. Spawns the Applier (if enabled)
    /// 4. Spawns the retention task (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(GlobalSyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            node_id = %self.config.node_id,
            sources = self.config.sources.len(),
            global_namespaces = self.topology.global_namespaces().len(),
            "Starting global sync node"
        );
        self.set_state(EngineState::Starting);

        let store = match DocumentStore::open(
            &self.config.node_id,
            &self.config.store.sqlite_path,
            self.config.store.wal_mode,
        )
        .await
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, path = %self.config.store.sqlite_path, "Failed to open document store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        let cursors = match CursorStore::new(&self.config.cursor.sqlite_path).await {
            Ok(cursors) => Arc::new(cursors),
            Err(e) => {
                error!(error = %e, path = %self.config.cursor.sqlite_path, "Failed to open cursor store");
                store.close().await;
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        self.store = Some(store);
        self.cursors = Some(cursors);

        if self.config.settings.tailer.enabled {
            for source in self.config.sources.clone() {
                self.spawn_tailer(&source, source.resume_from)?;
            }
        } else {
            info!("Tailers disabled; node will not publish to the global log");
        }

        if self.config.settings.applier.enabled {
            self.spawn_applier(self.config.settings.applier.resume_from)?;
        }

        if self.config.settings.retention.enabled {
            self.spawn_retention()?;
        }

        self.set_state(EngineState::Running);
        info!(
            links = self.links.len(),
            gol_head = self.log.head(),
            "Global sync node running"
        );
        Ok(())
    }

    fn started_stores(&self) -> Result<(Arc<DocumentStore>, Arc<CursorStore>)> {
        match (&self.store, &self.cursors) {
            (Some(store), Some(cursors)) => Ok((Arc::clone(store), Arc::clone(cursors))),
            _ => Err(GlobalSyncError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            }),
        }
    }

    fn spawn_tailer(&self, source: &SourceConfig, resume_from: ResumeFrom) -> Result<()> {
        let (store, cursors) = self.started_stores()?;

        let (operation_source, circuit) = match source.kind {
            SourceKind::Local => (store as Arc<dyn OperationSource>, CircuitConfig::default()),
            SourceKind::Redis { .. } => {
                let redis = RedisSource::from_config(source)?.with_retry(RetryConfig::daemon());
                (
                    Arc::new(redis) as Arc<dyn OperationSource>,
                    CircuitConfig::for_source(source),
                )
            }
        };

        let link = LinkHandle::register(&self.links, LinkRole::Tailer, &source.origin_id);
        let mut tailer = SourceTailer::new(
            operation_source,
            Arc::clone(&self.log),
            cursors,
            Arc::clone(&self.topology),
            self.config.settings.tailer.clone(),
        )
        .with_circuit(circuit)
        .with_slo(self.config.settings.slo.clone())
        .with_link(link.clone());
        if let Some(limiter) = &self.rate_limiter {
            tailer = tailer.with_rate_limiter(Arc::clone(limiter));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tail_path::spawn_tailer(tailer, resume_from, shutdown_rx);
        self.workers
            .insert(link.name().to_string(), Worker { shutdown, handle });
        info!(origin_id = %source.origin_id, ?resume_from, "Spawned tailer");
        Ok(())
    }

    fn spawn_applier(&self, resume_from: ResumeFrom) -> Result<()> {
        let (store, _) = self.started_stores()?;
        let destination_id = self.config.destination_id().to_string();
        self.topology.register_destination(&destination_id, resume_from);

        let link = LinkHandle::register(&self.links, LinkRole::Applier, &destination_id);
        let applier = GlobalApplier::new(
            &destination_id,
            Arc::clone(&self.log),
            store,
            Arc::clone(&self.topology),
            self.config.settings.applier.clone(),
        )
        .with_circuit(Arc::clone(&self.circuit))
        .with_slo(self.config.settings.slo.clone())
        .with_link(link.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = apply_path::spawn_applier(applier, resume_from, shutdown_rx);
        self.workers
            .insert(link.name().to_string(), Worker { shutdown, handle });
        info!(destination_id = %destination_id, ?resume_from, "Spawned applier");
        Ok(())
    }

    fn spawn_retention(&self) -> Result<()> {
        let (store, cursors) = self.started_stores()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = apply_path::spawn_retention(
            Arc::clone(&self.log),
            store,
            cursors,
            self.config.settings.retention.interval_duration(),
            shutdown_rx,
        );
        self.workers
            .insert(RETENTION_WORKER.to_string(), Worker { shutdown, handle });
        debug!("Spawned retention task");
        Ok(())
    }

    /// Signal one worker and wait for it to finish its current batch.
    async fn stop_worker(&self, name: &str) {
        let Some((_, worker)) = self.workers.remove(name) else {
            return;
        };
        let _ = worker.shutdown.send(true);
        match tokio::time::timeout(DRAIN_TIMEOUT, worker.handle).await {
            Ok(Ok(())) => debug!(worker = %name, "Worker stopped"),
            Ok(Err(e)) => warn!(worker = %name, error = %e, "Worker panicked"),
            Err(_) => warn!(worker = %name, "Worker timed out while stopping"),
        }
    }

    // =========================================================================
    // Operator calls
    // =========================================================================

    /// Add an origin stream to this node.
    ///
    /// If the node is running the Tailer starts immediately, otherwise at
    /// `start()`.
    pub fn register_source(&mut self, source: SourceConfig) -> Result<()> {
        if self
            .config
            .sources
            .iter()
            .any(|s| s.origin_id == source.origin_id)
        {
            return Err(GlobalSyncError::Config(format!(
                "source '{}' is already registered",
                source.origin_id
            )));
        }
        if matches!(source.kind, SourceKind::Local) && source.origin_id != self.config.node_id {
            return Err(GlobalSyncError::Config(format!(
                "local source '{}' must use the node's own id '{}'",
                source.origin_id, self.config.node_id
            )));
        }

        self.topology
            .register_source(&source.origin_id, source.resume_from);
        if self.is_running() && self.config.settings.tailer.enabled {
            self.spawn_tailer(&source, source.resume_from)?;
        }
        info!(origin_id = %source.origin_id, "Source registered");
        self.config.sources.push(source);
        Ok(())
    }

    /// Mark a namespace global. Operations on it are published from now on;
    /// earlier operations are not backfilled.
    pub fn mark_global(&self, namespace: Namespace, granularity: Granularity) {
        self.topology.mark_global(namespace, granularity);
    }

    /// Conflict Records for a namespace, oldest first.
    pub async fn conflicts(&self, namespace: &Namespace) -> Result<Vec<ConflictRecord>> {
        let (store, _) = self.started_stores()?;
        store.conflicts().list(namespace).await
    }

    /// Restart the Tailer for `origin_id` from an explicit position.
    ///
    /// This is the recovery path after a fatal tailer error (gap, lost
    /// cursor). The current Tailer, failed or not, is stopped first.
    pub async fn resync_source(&self, origin_id: &str, resume_from: ResumeFrom) -> Result<()> {
        if !self.is_running() {
            return Err(GlobalSyncError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        let source = self
            .config
            .sources
            .iter()
            .find(|s| s.origin_id == origin_id)
            .cloned()
            .ok_or_else(|| GlobalSyncError::Config(format!("unknown source '{}'", origin_id)))?;

        warn!(origin_id, ?resume_from, "Operator resync of tailer");
        self.stop_worker(&LinkHandle::link_name(LinkRole::Tailer, origin_id))
            .await;
        self.spawn_tailer(&source, resume_from)
    }

    /// Restart the Applier from an explicit position.
    pub async fn resync_applier(&self, resume_from: ResumeFrom) -> Result<()> {
        if !self.is_running() {
            return Err(GlobalSyncError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        if !self.config.settings.applier.enabled {
            return Err(GlobalSyncError::Config("applier is disabled".into()));
        }

        warn!(destination_id = %self.config.destination_id(), ?resume_from, "Operator resync of applier");
        self.stop_worker(&LinkHandle::link_name(
            LinkRole::Applier,
            self.config.destination_id(),
        ))
        .await;
        self.spawn_applier(resume_from)
    }

    /// Shut the node down gracefully.
    ///
    /// 1. Signals every worker to stop after its current batch
    /// 2. Waits for workers to drain (with timeout)
    /// 3. Checkpoints and closes the document and cursor stores
    ///
    /// The global log is shared and stays open.
    pub async fn shutdown(&mut self) {
        info!("Shutting down global sync node");
        self.set_state(EngineState::ShuttingDown);

        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for name in &names {
            if let Some(worker) = self.workers.get(name) {
                let _ = worker.shutdown.send(true);
            }
        }
        if !names.is_empty() {
            info!(task_count = names.len(), "Waiting for workers to drain");
        }
        for name in &names {
            self.stop_worker(name).await;
        }

        if let Some(cursors) = self.cursors.take() {
            cursors.close().await;
        }
        if let Some(store) = self.store.take() {
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("Global sync node stopped");
    }
}

impl std::fmt::Debug for GlobalSyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSyncNode")
            .field("node_id", &self.config.node_id)
            .field("state", &self.state())
            .field("links", &self.links.len())
            .finish()
    }
}
