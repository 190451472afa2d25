//! Wall-clock sources.
//!
//! Components that stamp or compare instants take a [`TimeSource`] instead of
//! calling the system clock directly, so tests can pin time and the
//! companion can layer its authority offset on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// A source of Unix-millisecond timestamps.
pub trait TimeSource: Send + Sync + 'static {
    /// Current instant in Unix milliseconds.
    fn now_ms(&self) -> i64;
}

/// Current system time in Unix milliseconds.
pub fn system_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> i64 {
        system_now_ms()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock pinned at `now_ms`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    /// Jump to `now_ms`.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward (or backward, for a negative delta) by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(delta_ms))
            });
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}
