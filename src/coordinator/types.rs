//! Node and link state types.
//!
//! # Node lifecycle
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (store, cursors, links ready)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(store or cursor store unavailable)──→ Failed
//! ```
//!
//! A link failing never moves the node out of `Running`. Each Tailer and
//! Applier reports its own [`LinkState`].

use crate::error::GlobalSyncError;
use dashmap::DashMap;
use std::sync::Arc;

/// State of a [`GlobalSyncNode`](super::GlobalSyncNode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Call [`start()`](super::GlobalSyncNode::start) to begin syncing.
    Created,
    /// Opening the store and cursors, resolving resume positions.
    Starting,
    /// Links are running.
    Running,
    /// Workers are finishing their current batch.
    ShuttingDown,
    /// Shut down cleanly.
    Stopped,
    /// The node could not start. Check logs.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Which role a link plays on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Origin stream into the GOL.
    Tailer,
    /// GOL into the local store.
    Applier,
}

impl LinkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRole::Tailer => "tailer",
            LinkRole::Applier => "applier",
        }
    }
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Running,
    /// Halted on a fatal error; needs operator resynchronization.
    Failed { reason: String },
    Stopped,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Running => "running",
            LinkState::Failed { .. } => "failed",
            LinkState::Stopped => "stopped",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LinkState::Failed { .. })
    }
}

/// Health of one Tailer or Applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHealth {
    /// `"tailer:<origin_id>"` or `"applier:<destination_id>"`.
    pub link: String,
    pub role: LinkRole,
    /// Origin or destination id.
    pub endpoint: String,
    pub state: LinkState,
    /// Last `origin_seq` (Tailer) or `global_seq` (Applier) committed.
    pub position: u64,
    pub last_error: Option<String>,
    /// Transient failures since the last successful batch.
    pub consecutive_failures: u32,
}

/// Comprehensive health status for monitoring endpoints.
///
/// Collected from in-memory state only; no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with every link up.
    pub ready: bool,
    /// Running and no link has failed.
    pub healthy: bool,
    pub gol_head: u64,
    pub links_total: usize,
    pub links_running: usize,
    pub links_failed: usize,
    pub links: Vec<LinkHealth>,
}

pub(crate) type LinkRegistry = Arc<DashMap<String, LinkHealth>>;

/// A worker's handle onto its entry in the node's link registry.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    name: String,
    registry: LinkRegistry,
}

impl LinkHandle {
    pub fn link_name(role: LinkRole, endpoint: &str) -> String {
        format!("{}:{}", role, endpoint)
    }

    pub(crate) fn register(registry: &LinkRegistry, role: LinkRole, endpoint: &str) -> Self {
        let name = Self::link_name(role, endpoint);
        registry.insert(
            name.clone(),
            LinkHealth {
                link: name.clone(),
                role,
                endpoint: endpoint.to_string(),
                state: LinkState::Running,
                position: 0,
                last_error: None,
                consecutive_failures: 0,
            },
        );
        crate::metrics::set_link_state(&name, "running");
        Self {
            name,
            registry: Arc::clone(registry),
        }
    }

    /// Handle backed by its own registry, for a worker running outside a node.
    pub fn detached(role: LinkRole, endpoint: &str) -> Self {
        Self::register(&LinkRegistry::default(), role, endpoint)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> Option<LinkHealth> {
        self.registry.get(&self.name).map(|e| e.clone())
    }

    pub fn set_position(&self, position: u64) {
        if let Some(mut entry) = self.registry.get_mut(&self.name) {
            entry.position = position;
            entry.consecutive_failures = 0;
        }
    }

    pub fn record_transient(&self, error: &GlobalSyncError, consecutive_failures: u32) {
        crate::metrics::record_link_error(&self.name, error.kind());
        if let Some(mut entry) = self.registry.get_mut(&self.name) {
            entry.last_error = Some(error.to_string());
            entry.consecutive_failures = consecutive_failures;
        }
    }

    pub fn fail(&self, error: &GlobalSyncError) {
        crate::metrics::record_link_error(&self.name, error.kind());
        self.set_state(LinkState::Failed {
            reason: error.to_string(),
        });
        if let Some(mut entry) = self.registry.get_mut(&self.name) {
            entry.last_error = Some(error.to_string());
        }
    }

    pub fn stop(&self) {
        self.set_state(LinkState::Stopped);
    }

    fn set_state(&self, state: LinkState) {
        crate::metrics::set_link_state(&self.name, state.as_str());
        if let Some(mut entry) = self.registry.get_mut(&self.name) {
            entry.state = state;
        }
    }
}
