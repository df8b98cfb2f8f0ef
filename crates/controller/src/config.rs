//! TOML config file loading and validation for the valve-box controller.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Limits and defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_ACTUATOR_TIMEOUT_SECS: u64 = 15;
pub const MIN_ACTUATOR_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_WEATHER_CACHE_MIN: u64 = 5;
pub const MIN_WEATHER_CACHE_MIN: u64 = 1;

pub const DEFAULT_SOIL_MOISTURE_THRESHOLD: f64 = 40.0;

/// Manual run length, minutes.
pub const DEFAULT_MANUAL_DURATION_MIN: u32 = 10;
pub const MANUAL_DURATION_RANGE: (u32, u32) = (1, 60);

/// Per-station flow rate, L/min.
pub const DEFAULT_FLOW_RATE_L_PER_MIN: f64 = 12.0;
pub const FLOW_RATE_RANGE: (f64, f64) = (1.0, 30.0);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("schedule must have {expected} months, got {got}")]
    ScheduleShape { expected: usize, got: usize },

    #[error("station {station} out of range [1, {stations}]")]
    StationOutOfRange { station: u8, stations: u8 },

    #[error("{field} {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{}", validation_summary(.0))]
    Invalid(Vec<String>),
}

fn validation_summary(errors: &[String]) -> String {
    format!(
        "config validation failed ({} error{}):\n  - {}",
        errors.len(),
        if errors.len() == 1 { "" } else { "s" },
        errors.join("\n  - ")
    )
}

pub fn check_manual_duration(minutes: u32) -> Result<u32, ConfigError> {
    let (min, max) = MANUAL_DURATION_RANGE;
    if (min..=max).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(ConfigError::OutOfRange {
            field: "manual duration",
            value: f64::from(minutes),
            min: f64::from(min),
            max: f64::from(max),
        })
    }
}

pub fn check_flow_rate(value: f64) -> Result<f64, ConfigError> {
    let (min, max) = FLOW_RATE_RANGE;
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            field: "flow rate",
            value,
            min,
            max,
        })
    }
}

pub fn check_station(station: u8, stations: u8) -> Result<u8, ConfigError> {
    if (1..=stations).contains(&station) {
        Ok(station)
    } else {
        Err(ConfigError::StationOutOfRange { station, stations })
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

fn default_stations() -> u8 {
    1
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_actuator_timeout() -> u64 {
    DEFAULT_ACTUATOR_TIMEOUT_SECS
}
fn default_cache_min() -> u64 {
    DEFAULT_WEATHER_CACHE_MIN
}
fn default_threshold() -> f64 {
    DEFAULT_SOIL_MOISTURE_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bluetooth MAC of the valve box, `AA:BB:CC:DD:EE:FF`.
    pub device_address: String,
    #[serde(default = "default_stations")]
    pub stations: u8,
    #[serde(default)]
    pub sprinkle_with_rain: bool,
    /// Irrigated area per station in m². Missing entries count as 0.
    #[serde(default)]
    pub station_areas: Vec<f64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_actuator_timeout")]
    pub actuator_timeout_secs: u64,
    /// Skip the valve link entirely and only log commands.
    #[serde(default)]
    pub mock: bool,
    /// `host:port` of the frame bridge that relays writes to the valve box.
    #[serde(default)]
    pub bridge_addr: Option<String>,
    #[serde(default)]
    pub soil_moisture: Option<SoilMoistureConfig>,
    #[serde(default)]
    pub weather: Option<WeatherConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilMoistureConfig {
    /// MQTT topic carrying a plain percentage.
    pub topic: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_cache_min")]
    pub cache_min: u64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl ControllerConfig {
    /// Validate every field. Returns `Ok(())` or an error listing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        // ── Identity ────────────────────────────────────────
        if self.device_address.trim().is_empty() {
            errors.push("device_address is empty".to_string());
        } else if !is_mac_address(&self.device_address) {
            errors.push(format!(
                "device_address '{}' is not a MAC address (AA:BB:CC:DD:EE:FF)",
                self.device_address
            ));
        }

        if self.stations == 0 {
            errors.push("stations must be at least 1".to_string());
        }

        // ── Station areas ───────────────────────────────────
        if self.station_areas.len() > usize::from(self.stations) {
            errors.push(format!(
                "station_areas has {} entries but only {} station(s) configured",
                self.station_areas.len(),
                self.stations
            ));
        }
        for (i, a) in self.station_areas.iter().enumerate() {
            if !a.is_finite() || *a < 0.0 {
                errors.push(format!(
                    "station {}: area {a} must be a non-negative number",
                    i + 1
                ));
            }
        }

        // ── Transport ───────────────────────────────────────
        if !self.mock {
            match self.bridge_addr.as_deref() {
                None => errors.push("bridge_addr is required unless mock = true".to_string()),
                Some(a) if a.trim().is_empty() => errors.push("bridge_addr is empty".to_string()),
                Some(_) => {}
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.timezone.parse::<Tz>().is_err() {
            errors.push(format!("timezone '{}' is not a known IANA zone", self.timezone));
        }
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            errors.push(format!(
                "poll_interval_secs must be at least {MIN_POLL_INTERVAL_SECS}, got {}",
                self.poll_interval_secs
            ));
        }
        if self.actuator_timeout_secs < MIN_ACTUATOR_TIMEOUT_SECS {
            errors.push(format!(
                "actuator_timeout_secs must be at least {MIN_ACTUATOR_TIMEOUT_SECS}, got {}",
                self.actuator_timeout_secs
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        if let Some(sm) = &self.soil_moisture {
            if sm.topic.trim().is_empty() {
                errors.push("soil_moisture.topic is empty".to_string());
            }
            if !(0.0..=100.0).contains(&sm.threshold) {
                errors.push(format!(
                    "soil_moisture.threshold {} out of range [0, 100]",
                    sm.threshold
                ));
            }
        }

        if let Some(w) = &self.weather {
            if w.api_key.trim().is_empty() {
                errors.push("weather.api_key is empty".to_string());
            }
            if !(-90.0..=90.0).contains(&w.latitude) {
                errors.push(format!("weather.latitude {} out of range [-90, 90]", w.latitude));
            }
            if !(-180.0..=180.0).contains(&w.longitude) {
                errors.push(format!(
                    "weather.longitude {} out of range [-180, 180]",
                    w.longitude
                ));
            }
            if w.cache_min < MIN_WEATHER_CACHE_MIN {
                errors.push(format!(
                    "weather.cache_min must be at least {MIN_WEATHER_CACHE_MIN}, got {}",
                    w.cache_min
                ));
            }
        }
    }

    /// Configured zone; `UTC` if the name does not parse (validation
    /// rejects that case up front).
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Area for `station` (1-based); unset stations report 0.
    pub fn station_area(&self, station: u8) -> f64 {
        self.station_areas
            .get(usize::from(station).saturating_sub(1))
            .copied()
            .unwrap_or(0.0)
    }

    /// Stable per-device key used for the snapshot row and MQTT topics.
    pub fn controller_id(&self) -> String {
        self.device_address.replace(':', "").to_lowercase()
    }

    pub fn soil_moisture_threshold(&self) -> Option<f64> {
        self.soil_moisture.as_ref().map(|s| s.threshold)
    }
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<ControllerConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    for s in (config.station_areas.len() + 1)..=usize::from(config.stations) {
        tracing::warn!(station = s, "no area configured, treating as 1 m²");
    }
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
