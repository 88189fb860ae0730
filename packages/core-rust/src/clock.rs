//! Wall-clock abstraction.
//!
//! Every time-driven decision in the engine (expiry cutoffs, delayed purge,
//! delete-bucket parity, binlog file names) reads the clock through
//! [`ClockSource`] so tests can move time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Abstraction over the system clock for dependency injection.
///
/// The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`; [`ManualClock`] is advanced explicitly.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;

    /// Returns the current time as whole seconds since Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now() / 1000
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `millis`.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
