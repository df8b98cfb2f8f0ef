//! Per-month watering plans: one [`MonthPlan`] for each calendar month.
//!
//! The serialized shape matches what the frontend card sends and what older
//! snapshots hold:
//!
//! ```json
//! { "interval_days": 2, "hours": ["06:00", "21:30"],
//!   "stations": { "station_1_minutes": 10, "station_2_minutes": 0 } }
//! ```

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::ConfigError;

pub const MONTHS: usize = 12;

/// Interval assumed when a stored plan omits `interval_days`.
const DEFAULT_INTERVAL_DAYS: u32 = 2;

fn default_interval_days() -> u32 {
    DEFAULT_INTERVAL_DAYS
}

// ---------------------------------------------------------------------------
// MonthPlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthPlan {
    #[serde(default = "default_interval_days")]
    pub interval_days: u32,
    #[serde(rename = "hours", default)]
    pub start_times: Vec<String>,
    #[serde(rename = "stations", default, with = "station_keys")]
    pub station_minutes: BTreeMap<u8, u32>,
}

impl MonthPlan {
    /// A plan that never waters: no start times, every station at zero.
    pub fn empty(stations: u8) -> Self {
        Self {
            interval_days: 0,
            start_times: Vec::new(),
            station_minutes: (1..=stations).map(|s| (s, 0)).collect(),
        }
    }

    /// Number of configured (non-blank) start times.
    pub fn occurrences(&self) -> usize {
        self.start_times
            .iter()
            .filter(|h| !h.trim().is_empty())
            .count()
    }

    pub fn has_start_times(&self) -> bool {
        self.occurrences() > 0
    }

    /// Parsed start times in configured order. Malformed entries are
    /// logged and skipped.
    pub fn parsed_start_times(&self) -> Vec<NaiveTime> {
        self.start_times
            .iter()
            .filter(|h| !h.trim().is_empty())
            .filter_map(|h| match parse_start_time(h) {
                Some(t) => Some(t),
                None => {
                    warn!(hour = %h, "schedule: invalid start time format, skipping");
                    None
                }
            })
            .collect()
    }

    pub fn minutes_for(&self, station: u8) -> u32 {
        self.station_minutes.get(&station).copied().unwrap_or(0)
    }

    /// Add zero-minute entries for new stations and drop obsolete ones.
    /// Returns whether anything changed.
    fn reconcile(&mut self, stations: u8) -> bool {
        let before = self.station_minutes.len();
        self.station_minutes.retain(|s, _| (1..=stations).contains(s));
        let mut changed = self.station_minutes.len() != before;
        for s in 1..=stations {
            if !self.station_minutes.contains_key(&s) {
                self.station_minutes.insert(s, 0);
                changed = true;
            }
        }
        changed
    }
}

/// Parse `"HH:MM"` (single-digit hours accepted).
pub fn parse_start_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Twelve month plans, index 0 = January.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MonthPlan>", into = "Vec<MonthPlan>")]
pub struct Schedule {
    months: Vec<MonthPlan>,
}

impl TryFrom<Vec<MonthPlan>> for Schedule {
    type Error = ConfigError;

    fn try_from(months: Vec<MonthPlan>) -> Result<Self, Self::Error> {
        if months.len() != MONTHS {
            return Err(ConfigError::ScheduleShape {
                expected: MONTHS,
                got: months.len(),
            });
        }
        Ok(Self { months })
    }
}

impl From<Schedule> for Vec<MonthPlan> {
    fn from(s: Schedule) -> Self {
        s.months
    }
}

impl Schedule {
    pub fn empty(stations: u8) -> Self {
        Self {
            months: vec![MonthPlan::empty(stations); MONTHS],
        }
    }

    pub fn months(&self) -> &[MonthPlan] {
        &self.months
    }

    /// Plan in effect on `date`.
    pub fn month_plan(&self, date: NaiveDate) -> &MonthPlan {
        &self.months[date.month0() as usize]
    }

    /// Replace all twelve plans, then reconcile them against the current
    /// station count. A wrong month count is rejected.
    pub fn set_schedule(&mut self, months: Vec<MonthPlan>, stations: u8) -> Result<(), ConfigError> {
        let mut next = Schedule::try_from(months)?;
        next.reconcile_station_count(stations);
        *self = next;
        Ok(())
    }

    /// Make every month's station keys match `stations`. Idempotent.
    pub fn reconcile_station_count(&mut self, stations: u8) -> bool {
        let mut changed = false;
        for m in &mut self.months {
            changed |= m.reconcile(stations);
        }
        changed
    }

    /// Scanning forward from `date`'s month (inclusive, wrapping), the first
    /// plan with at least one start time.
    pub fn next_configured_month(&self, date: NaiveDate) -> Option<&MonthPlan> {
        let start = date.month0() as usize;
        (0..MONTHS)
            .map(|i| &self.months[(start + i) % MONTHS])
            .find(|m| m.has_start_times())
    }

    pub fn has_any_start_times(&self) -> bool {
        self.months.iter().any(MonthPlan::has_start_times)
    }
}

// ---------------------------------------------------------------------------
// "station_N_minutes" map keys
// ---------------------------------------------------------------------------

mod station_keys {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<u8, u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(s, m)| (format!("station_{s}_minutes"), *m)))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<BTreeMap<u8, u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, u32>::deserialize(d)?;
        raw.into_iter()
            .map(|(k, v)| {
                parse_key(&k)
                    .map(|s| (s, v))
                    .ok_or_else(|| D::Error::custom(format!("invalid station key '{k}'")))
            })
            .collect()
    }

    /// Accepts "station_3_minutes" and a bare "3".
    pub(super) fn parse_key(k: &str) -> Option<u8> {
        let n = k
            .strip_prefix("station_")
            .and_then(|rest| rest.strip_suffix("_minutes"))
            .unwrap_or(k);
        n.parse().ok().filter(|s| *s > 0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
