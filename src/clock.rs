//! Time source abstraction.
//!
//! Queue firing times come from a [`Clock`] owned by the connection, so tests
//! can drive delayed delivery with [`MockClock`] instead of sleeping.

use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Current time as nanoseconds since the Unix epoch.
    ///
    /// Queue time-keys are ordered by this value.
    fn now_unix_nanos(&self) -> u64 {
        unix_nanos(self.now())
    }
}

/// Nanoseconds since the Unix epoch, saturating at zero for pre-epoch times
/// and at `u64::MAX` far past it.
pub(crate) fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap();
        *now += duration;
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
