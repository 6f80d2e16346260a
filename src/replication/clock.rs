//! Wall-clock abstraction for lag decisions.
//!
//! ISR membership depends on *when* a follower last caught up, so the clock
//! is injected rather than read ambiently. Production code uses
//! [`SystemClock`]; tests drive [`ManualClock`] to simulate lagging followers
//! without sleeping.

use std::fmt;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests.
#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: std::sync::atomic::AtomicI64,
}

#[cfg(any(test, feature = "test-utilities"))]
impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            ms: std::sync::atomic::AtomicI64::new(start_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, delta_ms: i64) {
        self.ms
            .fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.ms.store(now_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-utilities"))]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}
