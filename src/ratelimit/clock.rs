//! Time source seam.
//!
//! The engine never reads a wall clock directly. Every timestamp it uses comes
//! from a [`Clock`], expressed as fractional seconds since the Unix epoch.

use parking_lot::Mutex;

/// A source of the current time, in seconds.
pub trait Clock: Send + Sync {
    /// Current time in (fractional) seconds.
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and simulations to step time without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, for a negative delta).
    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    /// Jump to an absolute time.
    pub fn set(&self, secs: f64) {
        *self.now.lock() = secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
