//! Time sources.
//!
//! Every timestamp in the engine is a signed nanosecond count relative to a
//! session epoch. Workers hold an `Arc<dyn Clock>` so tests can drive time by
//! hand while the real pipeline reads a monotonic clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A source of monotonic nanosecond timestamps.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i64;

    fn now_sec(&self) -> f64 {
        self.now_ns() as f64 / NANOS_PER_SEC as f64
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Monotonic clock anchored at construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

/// Clock that only moves when told to. Used by tests and offline drivers.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ns(&self, ns: i64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
    }

    pub fn advance_sec(&self, sec: f64) {
        self.now
            .fetch_add((sec * NANOS_PER_SEC as f64).round() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn sec_to_ns(sec: f64) -> i64 {
    (sec * NANOS_PER_SEC as f64).round() as i64
}

pub fn ns_to_sec(ns: i64) -> f64 {
    ns as f64 / NANOS_PER_SEC as f64
}
