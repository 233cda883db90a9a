//! Retry backoff and rate limiting for long-lived workers.
//!
//! - [`RetryConfig`]: exponential backoff, used for origin connections and
//!   for Tailer/Applier retries after transient errors
//! - [`RateLimiter`]: `governor` token bucket pacing a Tailer's appends

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Per-attempt timeout when opening a connection.
    pub connection_timeout: Duration,
}

impl RetryConfig {
    /// First connection to an origin: bounded, gentle growth.
    ///
    /// ```text
    /// attempt  1     2      3      ...  20
    /// delay    500ms 750ms  1.125s ...  30s (cap)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Running links: 1s doubling to 300s, forever.
    pub fn daemon() -> Self {
        Self::worker(1_000, 300_000)
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Doubling backoff from `base_ms` capped at `max_ms`, never giving up.
    pub fn worker(base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `attempt` (1-indexed; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        if !ms.is_finite() || ms >= cap {
            return self.max_delay;
        }
        Duration::from_millis(ms.round() as u64)
    }
}

/// Sustained rate and burst for a Tailer's appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub burst: u32,
}

/// Token bucket shared by the Tailers of a node.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for one permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
