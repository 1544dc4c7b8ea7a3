//! Time Sources
//!
//! Endpoint windows measure elapsed time on a monotonic clock. Quota periods
//! align to wall-clock hours. Both come from one injectable [`Clock`] so tests
//! can drive time explicitly.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::config::QUOTA_PERIOD_SECS;

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync + Debug {
    /// Monotonic time since the clock's origin; never goes backwards
    fn monotonic(&self) -> Duration;

    /// Wall-clock time, used only for hour-boundary alignment
    fn wall(&self) -> DateTime<Utc>;
}

/// Real clock backed by `Instant` and the system time
#[derive(Debug, Clone)]
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
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Duration, DateTime<Utc>)>,
}

impl ManualClock {
    /// Start at monotonic zero and the given wall time
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((Duration::ZERO, wall)),
        }
    }

    /// Start at an exact hour boundary (2024-01-01T00:00:00Z)
    pub fn at_hour_boundary() -> Self {
        Self::new(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }

    /// Move both time sources forward
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += by;
        state.1 += TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
    }

    /// Jump the wall clock without touching monotonic time (NTP step, DST bugs)
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.1 = wall;
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn wall(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

/// Most recent hour boundary at or before `t`
pub fn hour_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    let floored = secs - secs.rem_euclid(QUOTA_PERIOD_SECS as i64);
    DateTime::from_timestamp(floored, 0).unwrap_or(t)
}

/// Whole seconds until the next hour boundary, in `1..=3600`
pub fn seconds_until_next_hour(t: DateTime<Utc>) -> u64 {
    let next = hour_floor(t) + TimeDelta::seconds(QUOTA_PERIOD_SECS as i64);
    let millis = (next - t).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).clamp(1, QUOTA_PERIOD_SECS)
}
