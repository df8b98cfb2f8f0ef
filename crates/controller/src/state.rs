use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::clock::{format_timestamp, Timestamp};
use crate::config::{ControllerConfig, DEFAULT_FLOW_RATE_L_PER_MIN, DEFAULT_MANUAL_DURATION_MIN};
use crate::dosing::{self, StationCalibration};
use crate::ledger::DailyLedger;
use crate::schedule::Schedule;
use crate::weather::ForecastBlock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<EngineState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StationState {
    Stopped,
    Sprinkling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

/// Everything one controller knows, owned in one place.
pub struct EngineState {
    pub started_at: Instant,
    pub config: ControllerConfig,
    pub schedule: Schedule,
    pub flow_rates: Vec<f64>,
    pub manual_duration_min: u32,
    pub ledger: DailyLedger,
    pub stations: Vec<StationState>,
    pub controller: PowerState,
    /// Last current-weather payload, verbatim.
    pub weather_current: Value,
    pub forecast: Vec<ForecastBlock>,
    pub soil_moisture: Option<f64>,
    pub next_watering: Option<Timestamp>,
    pub mqtt_connected: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: String,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Irrigation,
    Weather,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub device: String,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub controller: PowerState,
    pub manual_duration_min: u32,
    pub stations: Vec<StationStatus>,
    pub has_rained_today: bool,
    pub is_raining_now: bool,
    pub will_rain_today: bool,
    pub rain_time_today_min: f64,
    pub rain_total_mm: f64,
    pub rain_forecast_mm: f64,
    pub total_water_consumption_l: f64,
    pub last_rain: Option<String>,
    pub last_sprinkle: Option<String>,
    pub last_reset: Option<String>,
    pub next_watering: Option<String>,
    pub soil_moisture: Option<f64>,
    pub events: Vec<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub station: u8,
    pub state: StationState,
    pub flow_rate_l_per_min: f64,
    pub area_m2: f64,
    pub target_mm: f64,
    pub applied_mm: f64,
    pub forecasted_sprinkle_mm: f64,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl EngineState {
    pub fn new(config: ControllerConfig) -> Self {
        let n = usize::from(config.stations);
        Self {
            started_at: Instant::now(),
            schedule: Schedule::empty(config.stations),
            flow_rates: vec![DEFAULT_FLOW_RATE_L_PER_MIN; n],
            manual_duration_min: DEFAULT_MANUAL_DURATION_MIN,
            ledger: DailyLedger::new(n),
            stations: vec![StationState::Stopped; n],
            controller: PowerState::On,
            weather_current: Value::Null,
            forecast: Vec::new(),
            soil_moisture: None,
            next_watering: None,
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
            config,
        }
    }

    pub fn station_count(&self) -> u8 {
        self.config.stations
    }

    /// Flow rate and area for `station` (1-based).
    pub fn calibration(&self, station: u8) -> StationCalibration {
        StationCalibration {
            flow_rate_l_per_min: self
                .flow_rates
                .get(usize::from(station).saturating_sub(1))
                .copied()
                .unwrap_or(DEFAULT_FLOW_RATE_L_PER_MIN),
            area_m2: self.config.station_area(station),
        }
    }

    pub fn calibrations(&self) -> Vec<StationCalibration> {
        (1..=self.station_count()).map(|s| self.calibration(s)).collect()
    }

    /// Today's per-station targets under the plan for `today`.
    pub fn targets_for(&self, today: NaiveDate) -> Vec<f64> {
        dosing::compute_targets(
            self.schedule.month_plan(today),
            &self.calibrations(),
            self.ledger.last_event(),
            today,
        )
    }

    pub fn any_sprinkling(&self) -> bool {
        self.stations.contains(&StationState::Sprinkling)
    }

    pub fn station_state(&self, station: u8) -> Option<StationState> {
        self.stations
            .get(usize::from(station).saturating_sub(1))
            .copied()
    }

    pub fn set_station(&mut self, station: u8, state: StationState) {
        if let Some(s) = self.stations.get_mut(usize::from(station).saturating_sub(1)) {
            *s = state;
        }
    }

    pub fn stop_all(&mut self) {
        self.stations.fill(StationState::Stopped);
    }

    /// Install a new config and resize every per-station vector to match.
    /// New stations start Stopped with the default flow rate.
    pub fn apply_config(&mut self, config: ControllerConfig) {
        let n = usize::from(config.stations);
        self.flow_rates.resize(n, DEFAULT_FLOW_RATE_L_PER_MIN);
        self.stations.resize(n, StationState::Stopped);
        self.ledger.resize(n);
        self.schedule.reconcile_station_count(config.stations);
        self.config = config;
    }

    pub fn record_event(&mut self, now: &Timestamp, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: format_timestamp(now),
            kind,
            detail,
        });
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let stations = (1..=self.station_count())
            .map(|s| {
                let i = usize::from(s) - 1;
                let cal = self.calibration(s);
                StationStatus {
                    station: s,
                    state: self.stations.get(i).copied().unwrap_or(StationState::Stopped),
                    flow_rate_l_per_min: cal.flow_rate_l_per_min,
                    area_m2: cal.area_m2,
                    target_mm: self.ledger.sprinkle_target_mm.get(i).copied().unwrap_or(0.0),
                    applied_mm: dosing::round2(
                        self.ledger.sprinkle_applied_mm.get(i).copied().unwrap_or(0.0),
                    ),
                    forecasted_sprinkle_mm: self.ledger.forecasted_sprinkle_now(s),
                }
            })
            .collect();

        let l = &self.ledger;
        StatusResponse {
            device: self.config.device_address.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            controller: self.controller,
            manual_duration_min: self.manual_duration_min,
            stations,
            has_rained_today: l.has_rained_today,
            is_raining_now: l.is_raining_now,
            will_rain_today: l.will_rain_today,
            rain_time_today_min: l.rain_time_today_min,
            rain_total_mm: dosing::round2(l.rain_depth_measured_mm),
            rain_forecast_mm: dosing::round2(l.rain_depth_forecast_mm),
            total_water_consumption_l: dosing::round2(l.total_water_consumption_l),
            last_rain: l.last_rain.as_ref().map(format_timestamp),
            last_sprinkle: l.last_sprinkle.as_ref().map(format_timestamp),
            last_reset: l.last_reset.as_ref().map(format_timestamp),
            next_watering: self.next_watering.as_ref().map(format_timestamp),
            soil_moisture: self.soil_moisture,
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ts;
    use chrono_tz::Tz;

    fn config(stations: u8, areas: Vec<f64>) -> ControllerConfig {
        ControllerConfig {
            device_address: "AA:BB:CC:DD:EE:FF".into(),
            stations,
            sprinkle_with_rain: false,
            station_areas: areas,
            timezone: "UTC".into(),
            poll_interval_secs: 60,
            actuator_timeout_secs: 15,
            mock: true,
            bridge_addr: None,
            soil_moisture: None,
            weather: None,
        }
    }

    #[test]
    fn new_state_has_defaults_per_station() {
        let st = EngineState::new(config(3, vec![10.0]));
        assert_eq!(st.flow_rates, vec![12.0; 3]);
        assert_eq!(st.stations, vec![StationState::Stopped; 3]);
        assert_eq!(st.controller, PowerState::On);
        assert_eq!(st.manual_duration_min, 10);
        assert_eq!(st.calibration(1).area_m2, 10.0);
        assert_eq!(st.calibration(2).area_m2, 0.0);
    }

    #[test]
    fn apply_config_resizes_everything() {
        let mut st = EngineState::new(config(2, vec![]));
        st.flow_rates[1] = 20.0;
        st.ledger.sprinkle_applied_mm[1] = 3.0;

        st.apply_config(config(4, vec![]));
        assert_eq!(st.flow_rates, vec![12.0, 20.0, 12.0, 12.0]);
        assert_eq!(st.stations.len(), 4);
        assert_eq!(st.ledger.sprinkle_applied_mm, vec![0.0, 3.0, 0.0, 0.0]);
        assert_eq!(st.schedule.months()[0].station_minutes.len(), 4);

        st.apply_config(config(1, vec![]));
        assert_eq!(st.flow_rates, vec![12.0]);
        assert_eq!(st.ledger.stations(), 1);
    }

    #[test]
    fn event_ring_buffer_is_bounded_and_newest_first() {
        let mut st = EngineState::new(config(1, vec![]));
        let now = ts(Tz::UTC, "2024-06-10 12:00:00");
        for i in 0..(MAX_EVENTS + 5) {
            st.record_event(&now, EventKind::System, format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 4));
    }

    #[test]
    fn status_reports_remaining_per_station() {
        let mut st = EngineState::new(config(2, vec![10.0, 10.0]));
        st.ledger
            .reset_daily(ts(Tz::UTC, "2024-06-10 00:00:00"), 0.0, vec![12.0, 0.0]);
        st.ledger.record_sprinkle_progress(1, 4.0, 40.0);
        st.set_station(1, StationState::Sprinkling);

        let status = st.to_status();
        assert_eq!(status.stations[0].state, StationState::Sprinkling);
        assert_eq!(status.stations[0].forecasted_sprinkle_mm, 8.0);
        assert_eq!(status.stations[1].forecasted_sprinkle_mm, 0.0);
        assert_eq!(status.last_reset.as_deref(), Some("2024-06-10 00:00:00"));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stations"][0]["state"], "sprinkling");
        assert_eq!(json["controller"], "on");
    }

    #[test]
    fn stop_all_clears_every_station() {
        let mut st = EngineState::new(config(3, vec![]));
        st.set_station(2, StationState::Sprinkling);
        assert!(st.any_sprinkling());
        st.stop_all();
        assert!(!st.any_sprinkling());
    }
}
