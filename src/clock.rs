//! Per-origin hybrid logical clock.
//!
//! Produces the `origin_timestamp` carried by every local write. Timestamps
//! track wall-clock milliseconds but are strictly increasing per origin, and
//! [`HybridClock::observe`] pulls the clock forward past every remote
//! timestamp the node applies. A write therefore always carries a larger
//! stamp than anything its origin had observed, so causal order and stamp
//! order agree.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free hybrid clock.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known value (restart recovery, tests).
    pub fn starting_at(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Next timestamp: `max(now_ms, last + 1)`, saturating at `u64::MAX`.
    pub fn tick(&self) -> u64 {
        let now = wall_millis();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(current.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a remote timestamp so later ticks order after it.
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }

    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn wall_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
