//! Time source used for every timestamp the engine writes.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock: every call to [`Clock::now`] returns the current
/// instant and then advances it by `step`.
///
/// Ordering rules such as "oldest due first" depend on creation timestamps,
/// so replays and tests use this to get a strict, reproducible order.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            state: Mutex::new(start),
            step,
        }
    }

    /// Moves the clock forward without producing a timestamp.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let current = *guard;
        *guard += self.step;
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_steps_monotonically() {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(start, Duration::seconds(1));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, start);
        assert_eq!(b - a, Duration::seconds(1));

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now() - b, Duration::seconds(301));
    }
}
