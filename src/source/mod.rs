// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream operation streams.
//!
//! An [`OperationSource`] is one origin's sequential, resumable stream of
//! local operations. The collaborator guarantees the stream is gapless and
//! durable once emitted; the Source Tailer still checks contiguity and
//! treats any hole as fatal.
//!
//! Implementations in this crate:
//! - [`DocumentStore`](crate::store::DocumentStore): the node's own local
//!   operation stream.
//! - [`RedisSource`]: a remote origin publishing to a Redis stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use global_sync::source::{BoxFuture, OperationSource, SourceBatch};
//! use std::time::Duration;
//!
//! struct Empty;
//!
//! impl OperationSource for Empty {
//!     fn origin_id(&self) -> &str {
//!         "rs-empty"
//!     }
//!
//!     fn fetch(&self, _after: u64, _limit: usize, _block: Duration) -> BoxFuture<'_, SourceBatch> {
//!         Box::pin(async move { Ok(SourceBatch::Operations(vec![])) })
//!     }
//! }
//! ```

pub mod redis;

pub use self::redis::RedisSource;

use crate::error::Result;
use crate::record::LocalOperation;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Result of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceBatch {
    /// Operations with `origin_seq > after`, in order. Empty after the block
    /// timeout expired with nothing new.
    Operations(Vec<LocalOperation>),
    /// The origin no longer holds the operations after `requested`; the
    /// oldest it still has is `oldest`.
    Trimmed { requested: u64, oldest: u64 },
}

/// One origin's local operation stream.
pub trait OperationSource: Send + Sync + 'static {
    /// Identity stamped on every record derived from this stream.
    fn origin_id(&self) -> &str;

    /// Fetch up to `limit` operations after `after`, waiting up to `block`
    /// when none are available.
    fn fetch(&self, after: u64, limit: usize, block: Duration) -> BoxFuture<'_, SourceBatch>;

    /// Whether the source is currently reachable (health surface only).
    fn is_connected(&self) -> bool {
        true
    }
}
