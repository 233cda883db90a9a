//! Configuration for a global sync node.
//!
//! This module defines all configuration types needed to run a node.
//! Configuration is passed to [`GlobalSyncNode::new()`](crate::GlobalSyncNode::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use global_sync::config::{GlobalSyncConfig, NamespaceConfig, SourceConfig};
//!
//! let config = GlobalSyncConfig {
//!     node_id: "rs-east".into(),
//!     sources: vec![
//!         SourceConfig::local("rs-east"),
//!         SourceConfig::redis("rs-west", "redis://west:6379"),
//!     ],
//!     namespaces: vec![NamespaceConfig::global("shop.orders")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! GlobalSyncConfig
//! ├── node_id: String              # This node's origin identity
//! ├── settings: SyncSettings
//! │   ├── tailer: TailerConfig     # Source tailing
//! │   ├── applier: ApplierConfig   # GOL replay into the local store
//! │   ├── retention: RetentionConfig
//! │   └── slo: SloConfig
//! ├── sources: Vec<SourceConfig>   # Origins this node tails into the GOL
//! ├── namespaces: Vec<NamespaceConfig>
//! ├── log: LogConfig               # GOL persistence
//! ├── store: StoreConfig           # Local collection store
//! └── cursor: CursorConfig         # Tailer resume positions
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "rs-east"
//!
//! settings:
//!   tailer:
//!     batch_size: 100
//!     block_timeout: "1s"
//!   applier:
//!     resume_from: checkpoint
//!
//! sources:
//!   - origin_id: "rs-east"
//!     kind: { type: local }
//!   - origin_id: "rs-west"
//!     kind: { type: redis, redis_url: "redis://west:6379" }
//!
//! namespaces:
//!   - namespace: "shop.orders"
//!     granularity: field
//! ```

use crate::conflict::Granularity;
use crate::error::{GlobalSyncError, Result};
use crate::record::Namespace;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `GlobalSyncNode::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSyncConfig {
    /// Origin identity of this node. Stamped on every local write and used by
    /// the Applier to skip records this node produced.
    pub node_id: String,

    #[serde(default)]
    pub settings: SyncSettings,

    /// Origins this node tails into the global log.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Per-namespace replication settings.
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for GlobalSyncConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            settings: SyncSettings::default(),
            sources: Vec::new(),
            namespaces: Vec::new(),
            log: LogConfig::default(),
            store: StoreConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl GlobalSyncConfig {
    /// Create a minimal in-memory config for testing.
    ///
    /// Tails the node's own local stream and replays into an in-memory store.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            settings: SyncSettings::for_testing(),
            sources: vec![SourceConfig::local(node_id)],
            namespaces: Vec::new(),
            log: LogConfig::in_memory(),
            store: StoreConfig::in_memory(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Destination id the Applier registers under.
    pub fn destination_id(&self) -> &str {
        self.settings
            .applier
            .destination_id
            .as_deref()
            .unwrap_or(&self.node_id)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(GlobalSyncError::Config("node_id must not be empty".into()));
        }

        let mut origins = HashSet::new();
        for source in &self.sources {
            if !origins.insert(source.origin_id.as_str()) {
                return Err(GlobalSyncError::Config(format!(
                    "duplicate source origin_id '{}'",
                    source.origin_id
                )));
            }
            if matches!(source.kind, SourceKind::Local) && source.origin_id != self.node_id {
                return Err(GlobalSyncError::Config(format!(
                    "local source '{}' must use the node's own id '{}'",
                    source.origin_id, self.node_id
                )));
            }
        }

        let mut namespaces = HashSet::new();
        for ns in &self.namespaces {
            let parsed = Namespace::new(ns.namespace.clone())?;
            if !namespaces.insert(parsed) {
                return Err(GlobalSyncError::Config(format!(
                    "duplicate namespace '{}'",
                    ns.namespace
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncSettings {
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub applier: ApplierConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

impl SyncSettings {
    /// Short waits so tests converge quickly.
    pub fn for_testing() -> Self {
        Self {
            tailer: TailerConfig {
                block_timeout: "50ms".to_string(),
                backoff_base_ms: 10,
                backoff_max_ms: 200,
                ..Default::default()
            },
            applier: ApplierConfig {
                idle_wait: "50ms".to_string(),
                backoff_base_ms: 10,
                backoff_max_ms: 200,
                ..Default::default()
            },
            retention: RetentionConfig {
                interval: "100ms".to_string(),
                ..Default::default()
            },
            slo: SloConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resume positions
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a Tailer or Applier starts.
///
/// Anything other than `Checkpoint` is an explicit operator resynchronization
/// and rewrites the stored position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    /// Use the durable checkpoint. Missing or inconsistent state is fatal.
    #[default]
    Checkpoint,
    /// Full resync from the start of the stream.
    Beginning,
    /// Operator-supplied position (last processed sequence).
    Position(u64),
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Thresholds that log a warning and bump a metric when exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable replay batch commit latency (ms).
    #[serde(default = "default_max_batch_apply_latency_ms")]
    pub max_batch_apply_latency_ms: u64,

    /// Maximum acceptable source fetch latency (ms), excluding block time.
    #[serde(default = "default_max_source_read_latency_ms")]
    pub max_source_read_latency_ms: u64,

    /// Maximum acceptable applier lag in records (`head - position`).
    #[serde(default = "default_max_apply_lag_records")]
    pub max_apply_lag_records: u64,
}

fn default_max_batch_apply_latency_ms() -> u64 {
    200
}

fn default_max_source_read_latency_ms() -> u64 {
    100
}

fn default_max_apply_lag_records() -> u64 {
    10_000
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_batch_apply_latency_ms: 200,
            max_source_read_latency_ms: 100,
            max_apply_lag_records: 10_000,
        }
    }
}

impl SloConfig {
    pub fn is_batch_apply_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_batch_apply_latency_ms
    }

    pub fn is_source_read_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_source_read_latency_ms
    }

    pub fn is_lag_violation(&self, lag_records: u64) -> bool {
        lag_records > self.max_apply_lag_records
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: one entry per origin this node tails
// ═══════════════════════════════════════════════════════════════════════════════

/// Where an origin's local operation stream lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// This node's own store.
    Local,
    /// A Redis stream published by a remote origin.
    Redis {
        redis_url: String,
        /// Key prefix used by the origin (e.g., "app:").
        #[serde(default)]
        stream_prefix: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub origin_id: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub resume_from: ResumeFrom,

    /// Number of consecutive failures before the source circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long to wait before trying again after the circuit opens (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl SourceConfig {
    pub fn local(origin_id: &str) -> Self {
        Self {
            origin_id: origin_id.to_string(),
            kind: SourceKind::Local,
            resume_from: ResumeFrom::Checkpoint,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }

    pub fn redis(origin_id: &str, redis_url: &str) -> Self {
        Self {
            origin_id: origin_id.to_string(),
            kind: SourceKind::Redis {
                redis_url: redis_url.to_string(),
                stream_prefix: None,
            },
            resume_from: ResumeFrom::Checkpoint,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }

    /// Operation stream key for Redis sources.
    pub fn stream_key(&self) -> Option<String> {
        match &self.kind {
            SourceKind::Local => None,
            SourceKind::Redis { stream_prefix, .. } => Some(oplog_stream_key(
                stream_prefix.as_deref().unwrap_or(""),
                &self.origin_id,
            )),
        }
    }
}

/// `"{prefix}global_sync:{origin_id}:oplog"`
pub fn oplog_stream_key(prefix: &str, origin_id: &str) -> String {
    format!("{}global_sync:{}:oplog", prefix, origin_id)
}

// ═══════════════════════════════════════════════════════════════════════════════
// NamespaceConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// `"<db>.<collection>"`
    pub namespace: String,
    #[serde(default = "default_true")]
    pub is_global: bool,
    #[serde(default)]
    pub granularity: Granularity,
}

impl NamespaceConfig {
    pub fn global(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            is_global: true,
            granularity: Granularity::Document,
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum operations per fetch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a fetch blocks waiting for new operations (e.g., "1s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Base backoff on transient errors. Doubles per consecutive failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum operations per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_batch_size() -> usize {
    100
}

fn default_block_timeout() -> String {
    "1s".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            block_timeout: "1s".to_string(),
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
            rate_limit_enabled: false,
            rate_limit_per_sec: 10_000,
            rate_limit_burst: 1000,
        }
    }
}

impl TailerConfig {
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                per_second: self.rate_limit_per_sec,
                burst: self.rate_limit_burst,
            })
        } else {
            None
        }
    }

    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        backoff(self.backoff_base_ms, self.backoff_max_ms, consecutive_failures)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplierConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Destination identity. Defaults to the node id.
    #[serde(default)]
    pub destination_id: Option<String>,

    #[serde(default)]
    pub resume_from: ResumeFrom,

    /// Maximum records per replay transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long to wait for new GOL records before polling again.
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_idle_wait() -> String {
    "1s".to_string()
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination_id: None,
            resume_from: ResumeFrom::Checkpoint,
            batch_size: 100,
            idle_wait: "1s".to_string(),
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
        }
    }
}

impl ApplierConfig {
    pub fn idle_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_wait).unwrap_or(Duration::from_secs(1))
    }

    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        backoff(self.backoff_base_ms, self.backoff_max_ms, consecutive_failures)
    }
}

fn backoff(base_ms: u64, max_ms: u64, consecutive_failures: u32) -> Duration {
    RetryConfig::worker(base_ms, max_ms).delay_for_attempt(consecutive_failures as usize)
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetentionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// GOL retention. Records are reclaimed once every registered destination
/// confirmed past them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to reclaim (e.g., "30s").
    #[serde(default = "default_retention_interval")]
    pub interval: String,

    /// Soft capacity. Exceeding it is reported, never enforced past
    /// unconfirmed positions. 0 disables the check.
    #[serde(default = "default_max_records")]
    pub max_records: u64,
}

fn default_retention_interval() -> String {
    "30s".to_string()
}

fn default_max_records() -> u64 {
    1_000_000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30s".to_string(),
            max_records: 1_000_000,
        }
    }
}

impl RetentionConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persistence configs
// ═══════════════════════════════════════════════════════════════════════════════

/// Global log persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub sqlite_path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "global_log.db".to_string(),
        }
    }
}

impl LogConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }
}

/// Local collection store persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sqlite_path: String,
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "global_sync_store.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

/// Tailer cursor persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    pub sqlite_path: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "global_sync_cursors.db".to_string(),
        }
    }
}

impl CursorConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
