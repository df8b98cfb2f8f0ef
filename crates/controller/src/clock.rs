//! Wall-clock access in the controller's configured timezone.
//!
//! Every timestamp the controller stores or compares is a `DateTime<Tz>` in
//! that one zone, so "days since last watering" is always a calendar-date
//! difference in local time.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

pub type Timestamp = DateTime<Tz>;

pub type SharedClock = Arc<dyn Clock>;

/// Persisted timestamp layout (local time, no offset).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
    fn tz(&self) -> Tz;
}

pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().with_timezone(&self.tz)
    }

    fn tz(&self) -> Tz {
        self.tz
    }
}

/// Resolve a local wall-clock time on `date`. Falls back to the earliest
/// valid instant on DST transitions; `None` only inside a DST gap.
pub fn at_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Timestamp> {
    tz.from_local_datetime(&date.and_time(time)).earliest()
}

/// The next local midnight strictly after `now`.
pub fn next_midnight(now: &Timestamp) -> Timestamp {
    let tomorrow = now.date_naive() + Duration::days(1);
    at_local(now.timezone(), tomorrow, NaiveTime::MIN)
        // Midnight can fall in a DST gap in a handful of zones.
        .unwrap_or_else(|| *now + Duration::days(1))
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str, tz: Tz) -> Option<Timestamp> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT).ok()?;
    tz.from_local_datetime(&naive).earliest()
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub struct FixedClock {
    now: std::sync::Mutex<Timestamp>,
}

#[cfg(test)]
impl FixedClock {
    pub fn at(now: Timestamp) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap()
    }

    fn tz(&self) -> Tz {
        self.now.lock().unwrap().timezone()
    }
}

/// Build a local timestamp for tests: `ts(Tz::UTC, "2024-06-10 05:30:00")`.
#[cfg(test)]
pub fn ts(tz: Tz, s: &str) -> Timestamp {
    parse_timestamp(s, tz).expect("valid test timestamp")
}
