//! The persisted record: everything needed to resume the day after a
//! restart. Key names are stable; older records must keep loading.

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::clock::{format_timestamp, parse_timestamp, Timestamp};
use crate::config::{
    check_manual_duration, DEFAULT_FLOW_RATE_L_PER_MIN, DEFAULT_MANUAL_DURATION_MIN,
};
use crate::schedule::Schedule;
use crate::state::EngineState;
use crate::weather::ForecastBlock;

pub const SNAPSHOT_VERSION: i64 = 1;

fn default_manual_duration() -> u32 {
    DEFAULT_MANUAL_DURATION_MIN
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub will_it_rain_today: bool,
    #[serde(default)]
    pub will_it_rain_today_forecast: Vec<ForecastBlock>,
    #[serde(default)]
    pub has_rained_today: bool,
    #[serde(default)]
    pub is_raining_now: bool,
    #[serde(default)]
    pub is_raining_now_json: Value,
    #[serde(default)]
    pub last_reset: Option<String>,
    #[serde(default)]
    pub last_sprinkle: Option<String>,
    #[serde(default)]
    pub last_rain: Option<String>,
    #[serde(default = "default_manual_duration")]
    pub irrigation_manual_duration: u32,
    #[serde(default)]
    pub water_flow_rate: Vec<f64>,
    #[serde(default)]
    pub rain_time_today: f64,
    #[serde(default)]
    pub rain_total_amount_today: f64,
    #[serde(default)]
    pub rain_total_amount_forecasted_today: f64,
    #[serde(default)]
    pub total_water_consumption: f64,
    #[serde(default)]
    pub sprinkle_total_amount_today: Vec<f64>,
    #[serde(default)]
    pub sprinkle_target_amount_today: Vec<f64>,
    #[serde(default)]
    pub forecasted_sprinkle_today: Vec<f64>,
    #[serde(default, deserialize_with = "lenient_schedule")]
    pub schedule: Option<Schedule>,
}

/// A stored schedule that no longer parses is dropped, not fatal.
fn lenient_schedule<'de, D>(d: D) -> Result<Option<Schedule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(d)?;
    Ok(raw.and_then(|v| match serde_json::from_value::<Schedule>(v) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("snapshot: stored schedule is invalid, using an empty one: {e}");
            None
        }
    }))
}

impl Snapshot {
    pub fn capture(st: &EngineState) -> Self {
        let l = &st.ledger;
        Self {
            will_it_rain_today: l.will_rain_today,
            will_it_rain_today_forecast: st.forecast.clone(),
            has_rained_today: l.has_rained_today,
            is_raining_now: l.is_raining_now,
            is_raining_now_json: st.weather_current.clone(),
            last_reset: l.last_reset.as_ref().map(format_timestamp),
            last_sprinkle: l.last_sprinkle.as_ref().map(format_timestamp),
            last_rain: l.last_rain.as_ref().map(format_timestamp),
            irrigation_manual_duration: st.manual_duration_min,
            water_flow_rate: st.flow_rates.clone(),
            rain_time_today: l.rain_time_today_min,
            rain_total_amount_today: l.rain_depth_measured_mm,
            rain_total_amount_forecasted_today: l.rain_depth_forecast_mm,
            total_water_consumption: l.total_water_consumption_l,
            sprinkle_total_amount_today: l.sprinkle_applied_mm.clone(),
            sprinkle_target_amount_today: l.sprinkle_target_mm.clone(),
            forecasted_sprinkle_today: l.forecasted_sprinkle_mm.clone(),
            schedule: Some(st.schedule.clone()),
        }
    }

    /// Load this record into `st`, whose config is already in place.
    /// Station-indexed vectors are resized to the configured station
    /// count; unparseable timestamps fall back to `now`.
    pub fn restore(self, st: &mut EngineState, now: &Timestamp) {
        let n = usize::from(st.station_count());
        let tz = now.timezone();

        st.ledger.will_rain_today = self.will_it_rain_today;
        st.forecast = self.will_it_rain_today_forecast;
        st.ledger.has_rained_today = self.has_rained_today;
        st.ledger.is_raining_now = self.is_raining_now;
        st.weather_current = self.is_raining_now_json;

        st.ledger.last_reset = restore_timestamp("last_reset", self.last_reset, tz, now);
        st.ledger.last_sprinkle = restore_timestamp("last_sprinkle", self.last_sprinkle, tz, now);
        st.ledger.last_rain = restore_timestamp("last_rain", self.last_rain, tz, now);

        st.manual_duration_min = match check_manual_duration(self.irrigation_manual_duration) {
            Ok(m) => m,
            Err(e) => {
                warn!("snapshot: {e}; using {DEFAULT_MANUAL_DURATION_MIN}");
                DEFAULT_MANUAL_DURATION_MIN
            }
        };

        st.ledger.rain_time_today_min = self.rain_time_today;
        st.ledger.rain_depth_measured_mm = self.rain_total_amount_today;
        st.ledger.rain_depth_forecast_mm = self.rain_total_amount_forecasted_today;
        st.ledger.total_water_consumption_l = self.total_water_consumption;

        st.flow_rates = sized(
            "water_flow_rate",
            self.water_flow_rate,
            n,
            DEFAULT_FLOW_RATE_L_PER_MIN,
        );
        st.ledger.sprinkle_applied_mm =
            sized("sprinkle_total_amount_today", self.sprinkle_total_amount_today, n, 0.0);
        st.ledger.sprinkle_target_mm =
            sized("sprinkle_target_amount_today", self.sprinkle_target_amount_today, n, 0.0);
        st.ledger.forecasted_sprinkle_mm =
            sized("forecasted_sprinkle_today", self.forecasted_sprinkle_today, n, 0.0);

        let count = st.station_count();
        st.schedule = self.schedule.unwrap_or_else(|| Schedule::empty(count));
        st.schedule.reconcile_station_count(count);
    }
}

/// Fit a stored per-station vector to `n` stations: extra entries are
/// dropped, new stations get `default`.
fn sized(field: &str, mut v: Vec<f64>, n: usize, default: f64) -> Vec<f64> {
    if v.len() != n {
        debug!(field, got = v.len(), expected = n, "snapshot: resizing");
        v.resize(n, default);
    }
    v
}

fn restore_timestamp(field: &str, raw: Option<String>, tz: Tz, now: &Timestamp) -> Option<Timestamp> {
    let raw = raw?;
    match parse_timestamp(&raw, tz) {
        Some(t) => Some(t),
        None => {
            error!(field, value = %raw, "snapshot: invalid timestamp, using now");
            Some(*now)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
