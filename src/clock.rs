use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

const NANOS_PER_MICRO: i64 = 1_000;

/// A hybrid wall + logical timestamp.
///
/// Ordered lexicographically by `(wall_nanos, logical)`. The logical
/// component disambiguates events within the same wall-clock nanosecond.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub wall_nanos: i64,
    pub logical: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_nanos: 0,
        logical: 0,
    };

    pub fn from_nanos(wall_nanos: i64) -> Self {
        Self {
            wall_nanos,
            logical: 0,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::from_nanos(micros * NANOS_PER_MICRO)
    }

    /// Wall component truncated to microseconds, the granularity of the
    /// persisted lease expiration column.
    pub fn as_micros(&self) -> i64 {
        self.wall_nanos / NANOS_PER_MICRO
    }

    /// Drops sub-microsecond precision and the logical component.
    pub fn round_to_micros(&self) -> Timestamp {
        Timestamp::from_micros(self.as_micros())
    }

    pub fn add(&self, d: Duration) -> Timestamp {
        Timestamp {
            wall_nanos: self.wall_nanos + d.as_nanos() as i64,
            logical: self.logical,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:010}", self.wall_nanos, self.logical)
    }
}

/// Monotonically non-decreasing clock.
///
/// Reads the system wall clock through [`OffsetDateTime`] and bumps the
/// logical component whenever the wall clock fails to move forward, so
/// two successive `now()` calls never return the same or a regressing
/// timestamp.
#[derive(Debug, Default)]
pub struct Clock {
    last: Mutex<Timestamp>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Timestamp {
        let wall = OffsetDateTime::now_utc().unix_timestamp_nanos() as i64;
        let mut last = self.last.lock().unwrap();
        let next = if wall > last.wall_nanos {
            Timestamp::from_nanos(wall)
        } else {
            Timestamp {
                wall_nanos: last.wall_nanos,
                logical: last.logical + 1,
            }
        };
        *last = next;
        next
    }
}
