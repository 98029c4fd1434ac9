//! Wall-clock sources for refill accounting.
//!
//! The limiter reads the time in the calling process and hands it to the store, so
//! the store's own clock never takes part in a decision.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Clock abstraction so refill timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Fractional seconds since the Unix epoch.
    fn now_seconds(&self) -> f64;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `seconds` since the epoch.
    pub fn new(seconds: f64) -> Self {
        Self {
            bits: AtomicU64::new(seconds.to_bits()),
        }
    }

    /// Jump to an absolute time; moving backwards is allowed.
    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let now = self.now_seconds();
        self.set(now + by.as_secs_f64());
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
