//! # Global Sync
//!
//! Multi-master global sync for document collections. Every node accepts
//! writes locally; namespaces marked global converge across all nodes
//! through a shared, totally ordered Global Operation Log (GOL).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               global-sync                                │
//! │                                                                          │
//! │  ┌───────────────┐   ┌──────────────┐   ┌───────────────────────────┐    │
//! │  │ OperationSource│──►│ SourceTailer │──►│ GlobalLog (global_seq)    │    │
//! │  │ (local / Redis)│   │ (per origin) │   │ dedup by (origin, seq)    │    │
//! │  └───────────────┘   └──────────────┘   └───────────────────────────┘    │
//! │          │                  │                         │                  │
//! │          │                  ▼                         ▼                  │
//! │          │           ┌─────────────┐        ┌───────────────────┐        │
//! │          │           │ CursorStore │        │ GlobalApplier     │        │
//! │          │           │ (SQLite)    │        │ (per destination) │        │
//! │          │           └─────────────┘        └───────────────────┘        │
//! │          │                                            │                  │
//! │          │                                            ▼                  │
//! │  ┌───────┴─────────────────────────────────────────────────────────┐     │
//! │  │ DocumentStore: documents, local stream, checkpoint, conflicts   │     │
//! │  └─────────────────────────────────────────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Total order**: every destination applies the same records in
//!    `global_seq` order.
//! 2. **Exactly-once effect**: tailers may re-deliver after a crash; the log
//!    absorbs duplicates by `(origin_id, origin_seq)`.
//! 3. **Deterministic resolution**: concurrent writes resolve by
//!    `(origin_timestamp, origin_id)`, and every collision leaves a
//!    Conflict Record in the sibling `<collection>.conflicts` namespace.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use global_sync::{GlobalLog, GlobalSyncConfig, GlobalSyncNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> global_sync::Result<()> {
//!     let log = Arc::new(GlobalLog::open("gol.db", 1_000_000).await?);
//!     let mut node = GlobalSyncNode::new(GlobalSyncConfig::default(), log)?;
//!     node.start().await?;
//!
//!     // Node runs until shutdown signal
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod batch;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod conflicts_log;
pub mod coordinator;
pub mod cursor;
pub mod document;
pub mod error;
pub mod log;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod source;
pub mod sqlite;
pub mod store;
pub mod tailer;
pub mod topology;

// Re-exports for convenience
pub use applier::GlobalApplier;
pub use batch::{BatchConfig, ReplayBatch, ReplayReport};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use config::{
    ApplierConfig, CursorConfig, GlobalSyncConfig, LogConfig, NamespaceConfig, ResumeFrom,
    RetentionConfig, SloConfig, SourceConfig, SourceKind, StoreConfig, SyncSettings, TailerConfig,
};
pub use conflict::{Granularity, Outcome, Resolution};
pub use conflicts_log::{ConflictRecord, ConflictStatus, ConflictsLog};
pub use coordinator::{EngineState, GlobalSyncNode, HealthCheck, LinkHealth, LinkRole, LinkState};
pub use cursor::CursorStore;
pub use error::{GlobalSyncError, Result};
pub use log::{AppendOutcome, GlobalLog, LogRead};
pub use record::{
    DocumentKey, Fields, LocalOperation, Namespace, OpKind, OperationRecord, Stamp, VectorTime,
};
pub use source::redis::RedisSource;
pub use source::{OperationSource, SourceBatch};
pub use store::DocumentStore;
pub use tailer::{SourceTailer, TailReport};
pub use topology::Topology;
