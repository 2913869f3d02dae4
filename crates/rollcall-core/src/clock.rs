//! Wall-clock and monotonic time sources.
//!
//! Persisted times are wall-clock values formatted as `YYYY-MM-DD HH:MM:SS`.
//! The cooldown guard uses a separate monotonic source so that it is not
//! affected by how wall-clock values were stored.

use chrono::{Local, NaiveDateTime, Timelike};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Format of every timestamp written to the store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Accepted when reading rows written by older versions with sub-second precision.
const TIMESTAMP_FORMAT_FRACTIONAL: &str = "%Y-%m-%d %H:%M:%S%.f";

pub trait Clock: Send {
    /// Current local wall-clock time, truncated to whole seconds.
    fn wall(&self) -> NaiveDateTime;
    /// Time elapsed on a monotonic counter since the clock was created.
    fn monotonic(&self) -> Duration;
}

/// Real clock: local time for persisted values, `Instant` for the cooldown.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock. Clones share the same underlying time.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

struct ManualTime {
    wall: NaiveDateTime,
    monotonic: Duration,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                wall: start,
                monotonic: Duration::ZERO,
            })),
        }
    }

    /// Advance both time sources.
    pub fn advance(&self, by: Duration) {
        let mut t = self.lock();
        t.wall += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        t.monotonic += by;
    }

    /// Move the wall clock only, e.g. to simulate an NTP step.
    pub fn set_wall(&self, wall: NaiveDateTime) {
        self.lock().wall = wall;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualTime> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> NaiveDateTime {
        self.lock().wall
    }

    fn monotonic(&self) -> Duration {
        self.lock().monotonic
    }
}

pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp, with or without fractional seconds.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT_FRACTIONAL))
        .ok()
}
