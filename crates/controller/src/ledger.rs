//! Day-scoped rain and irrigation accounting.
//!
//! ```text
//! Unreset ──midnight──▶ Reset ──rain / sprinkle──▶ Accumulating ──midnight──▶ Reset
//! ```
//!
//! "Already reset today" is derived from `last_reset`'s calendar date rather
//! than stored as a flag, so a restart mid-day neither skips nor repeats the
//! reset.

use crate::clock::Timestamp;
use crate::dosing;

#[derive(Debug, Clone, PartialEq)]
pub struct DailyLedger {
    pub has_rained_today: bool,
    pub is_raining_now: bool,
    pub will_rain_today: bool,
    /// Minutes of observed rain today.
    pub rain_time_today_min: f64,
    pub rain_depth_measured_mm: f64,
    /// Measured rain plus what the forecast still expects today.
    pub rain_depth_forecast_mm: f64,
    pub sprinkle_target_mm: Vec<f64>,
    pub sprinkle_applied_mm: Vec<f64>,
    /// Remaining irrigation expected at reset time, after forecast rain.
    pub forecasted_sprinkle_mm: Vec<f64>,
    pub last_rain: Option<Timestamp>,
    pub last_sprinkle: Option<Timestamp>,
    pub last_reset: Option<Timestamp>,
    /// Lifetime counter; never reset.
    pub total_water_consumption_l: f64,
}

impl DailyLedger {
    pub fn new(stations: usize) -> Self {
        Self {
            has_rained_today: false,
            is_raining_now: false,
            will_rain_today: false,
            rain_time_today_min: 0.0,
            rain_depth_measured_mm: 0.0,
            rain_depth_forecast_mm: 0.0,
            sprinkle_target_mm: vec![0.0; stations],
            sprinkle_applied_mm: vec![0.0; stations],
            forecasted_sprinkle_mm: vec![0.0; stations],
            last_rain: None,
            last_sprinkle: None,
            last_reset: None,
            total_water_consumption_l: 0.0,
        }
    }

    pub fn stations(&self) -> usize {
        self.sprinkle_applied_mm.len()
    }

    /// Zero-fill or truncate every per-station vector to `stations`.
    pub fn resize(&mut self, stations: usize) {
        self.sprinkle_target_mm.resize(stations, 0.0);
        self.sprinkle_applied_mm.resize(stations, 0.0);
        self.forecasted_sprinkle_mm.resize(stations, 0.0);
    }

    /// Most recent rain or sprinkle.
    pub fn last_event(&self) -> Option<&Timestamp> {
        self.last_rain.as_ref().max(self.last_sprinkle.as_ref())
    }

    /// Fold one poll's rain observation into the day. Returns whether it is
    /// raining, which is the engine's cue to interrupt running stations
    /// unless sprinkling in rain is allowed.
    pub fn record_rain_observation(
        &mut self,
        raining: bool,
        depth_this_tick_mm: f64,
        poll_secs: u64,
        now: Timestamp,
    ) -> bool {
        self.is_raining_now = raining;
        if raining {
            self.has_rained_today = true;
            self.last_rain = Some(now);
            self.rain_time_today_min += poll_secs as f64 / 60.0;
            self.rain_depth_measured_mm += depth_this_tick_mm.max(0.0);
        }
        raining
    }

    /// Credit water delivered to `station` (1-based).
    pub fn record_sprinkle_progress(&mut self, station: u8, mm: f64, liters: f64) {
        if let Some(applied) = self.sprinkle_applied_mm.get_mut(usize::from(station) - 1) {
            *applied += mm;
        }
        self.total_water_consumption_l += liters;
    }

    pub fn is_reset_due(&self, now: &Timestamp) -> bool {
        match &self.last_reset {
            Some(last) => last.date_naive() != now.date_naive(),
            None => true,
        }
    }

    /// Start a new day: clear day-scoped counters, install today's targets
    /// and the remaining-day rain forecast.
    pub fn reset_daily(&mut self, now: Timestamp, forecast_rain_mm: f64, targets: Vec<f64>) {
        let stations = self.stations();
        self.has_rained_today = false;
        self.will_rain_today = false;
        self.rain_time_today_min = 0.0;
        self.rain_depth_measured_mm = 0.0;
        self.rain_depth_forecast_mm = forecast_rain_mm.max(0.0);
        self.sprinkle_applied_mm = vec![0.0; stations];
        self.sprinkle_target_mm = targets;
        self.sprinkle_target_mm.resize(stations, 0.0);
        self.forecasted_sprinkle_mm = self
            .sprinkle_target_mm
            .iter()
            .map(|t| (t - self.rain_depth_forecast_mm).max(0.0))
            .collect();
        self.last_reset = Some(now);
    }

    /// Depth still owed to `station` (1-based) after applied water and rain.
    pub fn remaining_mm(&self, station: u8) -> f64 {
        let i = usize::from(station) - 1;
        match (self.sprinkle_target_mm.get(i), self.sprinkle_applied_mm.get(i)) {
            (Some(t), Some(a)) => dosing::remaining_mm(*t, *a, self.rain_depth_forecast_mm),
            _ => 0.0,
        }
    }

    /// True when any station is still owed water today.
    pub fn needs_watering(&self) -> bool {
        (1..=self.stations()).any(|s| self.remaining_mm(s as u8) > 0.0)
    }

    /// Published per-station figure: what is still owed right now.
    pub fn forecasted_sprinkle_now(&self, station: u8) -> f64 {
        let i = usize::from(station) - 1;
        match (self.sprinkle_target_mm.get(i), self.sprinkle_applied_mm.get(i)) {
            (Some(t), Some(a)) => dosing::forecasted_sprinkle(*t, *a, self.rain_depth_forecast_mm),
            _ => 0.0,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
