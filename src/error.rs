// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for global sync.
//!
//! Errors are categorized by how a worker must react to them, not only by
//! where they came from. Duplicate deliveries and conflicts are *not* errors:
//! they surface as outcome values ([`AppendOutcome`](crate::log::AppendOutcome),
//! [`ConflictRecord`](crate::conflicts_log::ConflictRecord)).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Redis` | Yes | No | Network errors talking to a remote origin's stream |
//! | `SourceConnection` | Yes | No | Origin unreachable, connection dropped |
//! | `Store` | Busy/IO only | No | SQLite errors (GOL, cursors, destination store) |
//! | `SequenceGap` | No | Yes | Origin trimmed operations before they were tailed |
//! | `TimestampRegression` | No | Yes | Origin stamped a write no later than its previous one |
//! | `LogTrimmed` | No | Yes | GOL reclaimed records a destination never applied |
//! | `ResumePosition` | No | Yes | Lost or corrupt resume position |
//! | `Config` | No | No | Configuration invalid |
//! | `Decompression` | No | No | Corrupt zstd payload |
//! | `RecordParse` | No | No | Malformed operation entry |
//! | `Serialization` | No | No | JSON encode/decode failure |
//! | `CircuitOpen` | Yes | No | Breaker open around a store or source |
//! | `DuplicateKey` | No | No | Local insert onto a live document |
//! | `InvalidState` | No | No | Node state machine violation |
//! | `Shutdown` | No | No | Node is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Workers retry [`GlobalSyncError::is_retryable()`] errors forever with
//! backoff; they are never surfaced as link failures. [`GlobalSyncError::is_fatal()`]
//! errors halt the one Tailer or Applier that hit them and require an explicit
//! resynchronization from the operator.

use thiserror::Error;

/// Result type alias for global sync operations.
pub type Result<T> = std::result::Result<T, GlobalSyncError>;

/// Errors that can occur while tailing, logging or applying operations.
#[derive(Error, Debug)]
pub enum GlobalSyncError {
    /// Redis connection or command error.
    ///
    /// Occurs when reading a remote origin's operation stream.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the GOL, cursor store or destination store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Origin connection failure.
    #[error("Source connection error ({origin_id}): {message}")]
    SourceConnection { origin_id: String, message: String },

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Operation entry parsing failure.
    #[error("Record parse error: {0}")]
    RecordParse(String),

    /// JSON serialization failure (patches, version vectors, conflict records).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The origin's operation stream no longer contains the next expected
    /// sequence number. Gap-filling would silently lose writes.
    #[error("Sequence gap for origin {origin_id}: expected origin_seq {expected}, found {found}")]
    SequenceGap {
        origin_id: String,
        expected: u64,
        found: u64,
    },

    /// An origin's `origin_timestamp` did not strictly increase. Replay keys
    /// idempotence on `(origin_id, origin_timestamp)`, so admitting the write
    /// would make every destination treat it as already applied.
    #[error("Timestamp regression for origin {origin_id} at origin_seq {origin_seq}: {found} is not after {previous}")]
    TimestampRegression {
        origin_id: String,
        origin_seq: u64,
        previous: u64,
        found: u64,
    },

    /// The GOL reclaimed records past a destination's resume position.
    #[error("Global log trimmed past destination {destination_id}: requested after {requested}, oldest retained {oldest}")]
    LogTrimmed {
        destination_id: String,
        requested: u64,
        oldest: u64,
    },

    /// Resume position missing or inconsistent at start.
    #[error("Resume position error ({link}): {message}")]
    ResumePosition { link: String, message: String },

    /// A circuit breaker rejected the call; back off and retry.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// A local insert targeted a document that already exists.
    #[error("Duplicate key {key} in {namespace}")]
    DuplicateKey { namespace: String, key: String },

    /// Node state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GlobalSyncError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a resume position error for a link.
    pub fn resume(link: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResumePosition {
            link: link.into(),
            message: message.into(),
        }
    }

    /// Check if this error is transient and should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::SourceConnection { .. } => true,
            Self::Store(e) => is_transient_sqlx(e),
            Self::Config(_) => false,
            Self::Decompression(_) => false,
            Self::RecordParse(_) => false,
            Self::Serialization(_) => false,
            Self::SequenceGap { .. } => false,
            Self::TimestampRegression { .. } => false,
            Self::LogTrimmed { .. } => false,
            Self::ResumePosition { .. } => false,
            Self::CircuitOpen(_) => true,
            Self::DuplicateKey { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error halts the link and requires operator resynchronization.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SequenceGap { .. }
                | Self::TimestampRegression { .. }
                | Self::LogTrimmed { .. }
                | Self::ResumePosition { .. }
        )
    }
}

impl GlobalSyncError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Redis { .. } => "redis",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::SourceConnection { .. } => "source_connection",
            Self::Decompression(_) => "decompression",
            Self::RecordParse(_) => "record_parse",
            Self::Serialization(_) => "serialization",
            Self::SequenceGap { .. } => "sequence_gap",
            Self::TimestampRegression { .. } => "timestamp_regression",
            Self::LogTrimmed { .. } => "log_trimmed",
            Self::ResumePosition { .. } => "resume_position",
            Self::CircuitOpen(_) => "circuit_open",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for GlobalSyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

/// SQLite errors worth retrying: busy/locked, pool exhaustion, I/O.
fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        other => crate::sqlite::is_sqlite_busy_error(other),
    }
}
