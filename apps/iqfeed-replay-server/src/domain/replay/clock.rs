//! Server clock.
//!
//! Pacing reads monotonic instants from an injected `Clock`, never from
//! `Instant::now()` directly, so tests can drive replay with a
//! `ManualClock`.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, TimeDelta};
use parking_lot::Mutex;

/// Process-wide read-only time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time, used for `T` heartbeat lines.
    fn wall_time(&self) -> NaiveDateTime;
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_wall: NaiveDateTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant and wall time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Local::now().naive_local())
    }

    /// Create a clock frozen at the current instant, reporting `wall` as
    /// its wall time.
    #[must_use]
    pub fn starting_at(wall: NaiveDateTime) -> Self {
        Self {
            base: Instant::now(),
            base_wall: wall,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(by);
    }

    /// Total time advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn wall_time(&self) -> NaiveDateTime {
        let offset = TimeDelta::from_std(self.elapsed()).unwrap_or(TimeDelta::MAX);
        self.base_wall
            .checked_add_signed(offset)
            .unwrap_or(NaiveDateTime::MAX)
    }
}
