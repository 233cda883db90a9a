//! Circuit breakers around the destination store and upstream sources.
//!
//! Built on `recloser`. An open breaker fails calls fast with
//! [`CircuitError::Rejected`] until its recovery timeout passes, then lets
//! a few trial calls through.
//!
//! A rejection is never a link failure: the Applier retries the same batch
//! and the Tailer re-fetches from the same position after backing off.
//!
//! ```rust,no_run
//! # use global_sync::circuit_breaker::{StoreCircuit, CircuitError};
//! # async fn example() {
//! let circuit = StoreCircuit::new();
//! match circuit.replay.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => {}
//!     Err(CircuitError::Rejected) => { /* back off */ }
//!     Err(CircuitError::Inner(_store_error)) => {}
//! }
//! # }
//! ```

use crate::config::SourceConfig;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Breaker thresholds.
///
/// `failure_threshold` is both the sampling window and the failure
/// percentage that trips it, so small values trip on the first bad window.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// Trial calls in half-open before closing.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Replay commits: a store that keeps failing gets a long rest.
    pub fn for_store() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Per-origin thresholds from the source's config entry.
    pub fn for_source(source: &SourceConfig) -> Self {
        Self {
            failure_threshold: source.circuit_failure_threshold.max(1),
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(source.circuit_reset_timeout_sec),
        }
    }

    /// Trips on two failures, recovers in 50ms.
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker. Every outcome is reported under
/// `global_sync_circuit_calls_total{circuit=<name>}`.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker. `f` is not called while open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inner.call(f()).await {
            Ok(value) => {
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                warn!(circuit = %self.name, "Circuit open; call rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failures", &self.failures())
            .field("rejections", &self.rejections())
            .finish()
    }
}

/// Circuits guarding the destination store, shared by a node's Applier
/// across restarts and resyncs.
#[derive(Debug)]
pub struct StoreCircuit {
    pub replay: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::for_store())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            replay: CircuitBreaker::new("store_replay", config),
        }
    }
}
