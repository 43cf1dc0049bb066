use chrono::{DateTime, Duration, Utc};

use crate::CoreError;

pub const MAX_DRIFT_MS: i64 = 300_000; // 5 minutes

/// Issues `updatedAt` stamps that never go backwards within a session, even
/// when two mutations land in the same instant or the wall clock steps back.
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: Option<DateTime<Utc>>,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Generate the next monotonically increasing timestamp.
    pub fn tick(&mut self) -> DateTime<Utc> {
        self.tick_at(Utc::now())
    }

    fn tick_at(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }

    /// Fold in a timestamp seen on a remote document so the next local tick
    /// orders after it.
    pub fn observe(&mut self, remote: DateTime<Utc>) -> Result<(), CoreError> {
        let now = Utc::now();
        let delta_ms = (remote - now).num_milliseconds();
        if delta_ms > MAX_DRIFT_MS {
            return Err(CoreError::ClockDriftTooLarge {
                delta_ms,
                max_ms: MAX_DRIFT_MS,
            });
        }
        if self.last.is_none_or(|last| remote > last) {
            self.last = Some(remote);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_monotonicity() {
        let mut clock = TimestampClock::new();
        let mut prev = clock.tick();
        for _ in 0..100 {
            let next = clock.tick();
            assert!(next > prev, "expected {next:?} > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn stepped_back_wall_clock_still_advances() {
        let mut clock = TimestampClock::new();
        let future = Utc::now() + Duration::seconds(100);
        clock.last = Some(future);

        let t1 = clock.tick();
        assert_eq!(t1, future + Duration::microseconds(1));
        let t2 = clock.tick_at(future - Duration::seconds(10));
        assert_eq!(t2, future + Duration::microseconds(2));
    }

    #[test]
    fn observe_orders_next_tick_after_remote() {
        let mut clock = TimestampClock::new();
        let remote = Utc::now() + Duration::seconds(30);
        clock.observe(remote).unwrap();
        assert!(clock.tick() > remote);
    }

    #[test]
    fn observe_ignores_older_remote() {
        let mut clock = TimestampClock::new();
        let local = clock.tick();
        clock.observe(local - Duration::seconds(60)).unwrap();
        assert_eq!(clock.last(), Some(local));
    }

    #[test]
    fn drift_rejection() {
        let mut clock = TimestampClock::new();
        let remote = Utc::now() + Duration::milliseconds(MAX_DRIFT_MS + 60_000);
        match clock.observe(remote) {
            Err(CoreError::ClockDriftTooLarge { delta_ms, max_ms }) => {
                assert!(delta_ms > MAX_DRIFT_MS);
                assert_eq!(max_ms, MAX_DRIFT_MS);
            }
            other => panic!("expected ClockDriftTooLarge, got {other:?}"),
        }
        assert!(clock.last().is_none());
    }
}
