use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Time source for the agent. Dwell accounting only ever uses `now()`;
/// `wall_now()` stamps the payload.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn wall_now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Hosts that replay recorded
/// lifecycle events and the tests drive time through `advance`.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        match self.offset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        let first = clock.now();
        assert_eq!(clock.now(), first);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - first, Duration::from_millis(1500));
        assert_eq!(
            (clock.wall_now() - clock.wall_origin).num_milliseconds(),
            1500
        );
    }
}
