//! Injected time source.
//!
//! The engine never reads the wall clock directly; replays and tests drive
//! a [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// Current time in microseconds since the Unix epoch.
    fn now_us(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// Settable clock for deterministic evaluation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn set(&self, ts_us: i64) {
        self.now_us.store(ts_us, Ordering::SeqCst);
    }

    /// Advance by `dt_us` and return the new time.
    pub fn advance(&self, dt_us: i64) -> i64 {
        self.now_us.fetch_add(dt_us, Ordering::SeqCst) + dt_us
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}
