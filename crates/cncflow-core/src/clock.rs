//! Wall-clock source for the scheduler's age checks and maintenance timers.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

/// The real UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = instant;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Periodic trigger driven by a [`Clock`] rather than a timer thread.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    every: TimeDelta,
    last: DateTime<Utc>,
}

impl PeriodicTimer {
    /// A timer that first fires one full period after `start`.
    #[must_use]
    pub fn new(every: TimeDelta, start: DateTime<Utc>) -> Self {
        Self { every, last: start }
    }

    /// Returns true and re-arms when at least one period elapsed since the last firing.
    pub fn fire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        let due = now - self.last >= self.every;
        if due {
            self.last = now;
        }
        due
    }
}
