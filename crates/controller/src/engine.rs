//! The irrigation engine: owns one controller's state and turns ticks,
//! timers and commands into valve actions.
//!
//! Triggers, all funnelled through the same `EngineState` write guard:
//!
//! ```text
//! startup ─┐
//! poll ────┤                        ┌─▶ start_irrigation ─▶ accrual task (1 tick/s)
//! midnight ┼─▶ check_and_schedule ──┤                              │
//! command ─┘      (one-shot timers) └─▶ run_watering_cycle         ▼
//!                                                        stop signal (watch)
//! ```
//!
//! Every mutation ends in [`Engine::commit`], which recomputes the next
//! watering date, persists the snapshot and publishes the status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{at_local, format_timestamp, next_midnight, SharedClock, Timestamp};
use crate::config::{
    check_flow_rate, check_manual_duration, check_station, ConfigError, ControllerConfig,
};
use crate::db::{Db, RunReason, WateringEvent};
use crate::dosing;
use crate::schedule::MonthPlan;
use crate::snapshot::Snapshot;
use crate::state::{
    EngineState, EventKind, PowerState, SharedState, StationState, StatusResponse,
};
use crate::valve::{self, ActuatorError, SharedActuator};
use crate::weather::{OpenWeatherMap, WeatherOracle, WeatherReport};

/// One accrual step credits one second of flow.
const ACCRUAL_TICK: Duration = Duration::from_secs(1);

/// A catch-up reset on poll only happens after 00:05 local, leaving the
/// midnight task room to run first.
const RESET_GRACE_SECS: u32 = 5 * 60;

/// Longest run the valve frame can express (u16 seconds).
const MAX_RUN_MINUTES: u32 = u16::MAX as u32 / 60;

const WEATHER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors & collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("station {0} is already sprinkling")]
    Busy(u8),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    #[error("failed to connect collaborators: {0}")]
    Connect(String),
    #[error("station {0}: stopped before the run started")]
    Cancelled(u8),
}

/// External collaborators, rebuilt on every reconfigure.
#[derive(Clone)]
pub struct Links {
    pub valve: SharedActuator,
    pub weather: Option<Arc<dyn WeatherOracle>>,
}

pub type Connector = Box<dyn Fn(&ControllerConfig) -> anyhow::Result<Links> + Send + Sync>;

/// Production wiring: valve link per `cfg`, OpenWeatherMap when configured.
pub fn connect_links(cfg: &ControllerConfig) -> anyhow::Result<Links> {
    let weather: Option<Arc<dyn WeatherOracle>> = match &cfg.weather {
        Some(w) => Some(Arc::new(OpenWeatherMap::new(w, WEATHER_HTTP_TIMEOUT)?)),
        None => None,
    };
    Ok(Links {
        valve: valve::connect(cfg),
        weather,
    })
}

/// How one irrigation run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub station: u8,
    pub seconds: u64,
    pub applied_mm: f64,
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    state: SharedState,
    links: RwLock<Links>,
    connector: Connector,
    db: Db,
    clock: SharedClock,
    /// Generation counter; every bump cancels all running accrual tasks.
    stop_tx: watch::Sender<u64>,
    status_tx: watch::Sender<Arc<StatusResponse>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    tick: Duration,
}

impl Engine {
    /// Build the engine and restore the persisted snapshot, if any.
    pub async fn open(
        config: ControllerConfig,
        db: Db,
        clock: SharedClock,
        connector: Connector,
    ) -> anyhow::Result<Arc<Self>> {
        Self::build(config, db, clock, connector, ACCRUAL_TICK).await
    }

    async fn build(
        config: ControllerConfig,
        db: Db,
        clock: SharedClock,
        connector: Connector,
        tick: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let links = connector(&config)?;
        let controller_id = config.controller_id();
        let mut st = EngineState::new(config);
        let now = clock.now();

        match db.load_snapshot(&controller_id).await {
            Ok(Some(snap)) => {
                snap.restore(&mut st, &now);
                if let Some(w) = &links.weather {
                    w.seed_forecast(st.forecast.clone()).await;
                }
                info!(device = %controller_id, "restored persisted snapshot");
            }
            Ok(None) => info!(device = %controller_id, "no persisted snapshot, starting fresh"),
            Err(e) => error!(device = %controller_id, "failed to load snapshot, starting fresh: {e:#}"),
        }
        st.record_event(&now, EventKind::System, "controller started".into());

        let status = Arc::new(st.to_status());
        let (status_tx, _) = watch::channel(status);
        let (stop_tx, _) = watch::channel(0u64);

        Ok(Arc::new(Self {
            state: Arc::new(RwLock::new(st)),
            links: RwLock::new(links),
            connector,
            db,
            clock,
            stop_tx,
            status_tx,
            timers: Mutex::new(Vec::new()),
            tick,
        }))
    }

    /// Latest published status; updates after every commit.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusResponse>> {
        self.status_tx.subscribe()
    }

    pub async fn status(&self) -> StatusResponse {
        self.state.read().await.to_status()
    }

    pub async fn recent_runs(&self, limit: i64) -> anyhow::Result<Vec<WateringEvent>> {
        let id = self.state.read().await.config.controller_id();
        self.db.recent_watering_events(&id, limit).await
    }

    /// Arm today's timers, publish, and spawn the poll and midnight loops.
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if !self.state.read().await.schedule.has_any_start_times() {
            warn!("no month has start times, only manual watering is possible");
        }
        self.poll().await;
        self.check_and_schedule_watering().await;

        let poller = Arc::clone(self);
        let midnight = Arc::clone(self);
        vec![
            tokio::spawn(async move { poller.run_poll_loop().await }),
            tokio::spawn(async move { midnight.run_midnight_loop().await }),
        ]
    }

    async fn run_poll_loop(self: Arc<Self>) {
        loop {
            let secs = self.state.read().await.config.poll_interval_secs;
            tokio::time::sleep(Duration::from_secs(secs)).await;
            self.poll().await;
        }
    }

    async fn run_midnight_loop(self: Arc<Self>) {
        loop {
            let now = self.clock.now();
            let wait = (next_midnight(&now) - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            debug!(secs = wait.as_secs(), "midnight task sleeping");
            tokio::time::sleep(wait).await;
            self.daily_reset().await;
            self.check_and_schedule_watering().await;
        }
    }

    // -- Persistence & publishing -------------------------------------------

    /// Recompute derived fields, persist, publish.
    async fn commit(&self) {
        let now = self.clock.now();
        let (id, snap, status) = {
            let mut st = self.state.write().await;
            st.next_watering = next_watering_date(&st, &now);
            (
                st.config.controller_id(),
                Snapshot::capture(&st),
                st.to_status(),
            )
        };
        if let Err(e) = self.db.save_snapshot(&id, &snap, &now).await {
            error!(device = %id, "failed to persist snapshot: {e:#}");
        }
        self.status_tx.send_replace(Arc::new(status));
    }

    pub async fn record_event(&self, kind: EventKind, detail: String) {
        let now = self.clock.now();
        self.state.write().await.record_event(&now, kind, detail);
    }

    async fn record_error(&self, detail: String) {
        self.record_event(EventKind::Error, detail).await;
    }

    async fn weather(&self) -> Option<Arc<dyn WeatherOracle>> {
        self.links.read().await.weather.clone()
    }

    async fn valve(&self) -> SharedActuator {
        Arc::clone(&self.links.read().await.valve)
    }

    // -- Daily cycle ----------------------------------------------------------

    /// One update tick: catch-up reset, weather, rain accounting and
    /// auto-stop. A weather failure keeps the previous weather values.
    pub async fn poll(&self) {
        let now = self.clock.now();
        let report = match self.weather().await {
            Some(w) => match w.report(&now).await {
                Ok(r) => Some(r),
                Err(e) => {
                    error!("weather update failed, keeping previous values: {e}");
                    self.record_error(format!("weather update failed: {e}")).await;
                    None
                }
            },
            None => Some(WeatherReport::default()),
        };

        let interrupt = {
            let mut st = self.state.write().await;
            let poll_secs = st.config.poll_interval_secs;

            if now.time().num_seconds_from_midnight() > RESET_GRACE_SECS
                && st.ledger.is_reset_due(&now)
            {
                let forecast = report.as_ref().map(|r| r.remaining_rain_mm).unwrap_or(0.0);
                reset_day(&mut st, &now, forecast);
            }

            match report {
                Some(r) => {
                    let was_raining = st.ledger.is_raining_now;
                    let depth = r.current.rain_depth_per_poll(poll_secs);
                    let raining = st
                        .ledger
                        .record_rain_observation(r.current.raining, depth, poll_secs, now);
                    if raining && !was_raining {
                        info!(depth_mm = depth, "rain started");
                        st.record_event(&now, EventKind::Weather, "rain started".into());
                    }
                    st.ledger.will_rain_today = r.will_rain_today;
                    st.ledger.rain_depth_forecast_mm =
                        r.remaining_rain_mm + st.ledger.rain_depth_measured_mm;
                    st.weather_current = r.current.raw;
                    st.forecast = r.forecast;
                    raining && !st.config.sprinkle_with_rain && st.any_sprinkling()
                }
                None => false,
            }
        };

        if interrupt {
            info!("raining, interrupting irrigation");
            if let Err(e) = self.stop_irrigation().await {
                warn!("rain stop failed: {e}");
            }
        }
        self.commit().await;
    }

    /// Midnight reset. Returns false when today's reset already happened.
    pub async fn daily_reset(&self) -> bool {
        let now = self.clock.now();
        if !self.state.read().await.ledger.is_reset_due(&now) {
            debug!("daily reset already done today");
            return false;
        }

        let forecast = match self.weather().await {
            Some(w) => match w.report(&now).await {
                Ok(r) => r.remaining_rain_mm,
                Err(e) => {
                    warn!("no rain forecast for daily reset: {e}");
                    0.0
                }
            },
            None => 0.0,
        };

        {
            let mut st = self.state.write().await;
            if !st.ledger.is_reset_due(&now) {
                return false;
            }
            reset_day(&mut st, &now, forecast);
        }
        self.commit().await;
        true
    }

    /// Whether any station is still owed water today.
    pub async fn needs_watering_today(&self) -> bool {
        self.state.read().await.ledger.needs_watering()
    }

    /// Arm one-shot timers for today's remaining start times, replacing any
    /// armed earlier. Returns how many were armed.
    pub async fn check_and_schedule_watering(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let today = now.date_naive();

        let mut timers = self.timers.lock().await;
        for t in timers.drain(..) {
            t.abort();
        }

        let start_times = {
            let st = self.state.read().await;
            let Some(plan) = st.schedule.next_configured_month(today) else {
                info!("no month has start times, nothing to schedule");
                return 0;
            };
            if !dosing::interval_elapsed(plan.interval_days, st.ledger.last_event(), today) {
                info!(
                    interval_days = plan.interval_days,
                    "interval since last rain/sprinkle not elapsed"
                );
                return 0;
            }
            if !st.ledger.needs_watering() {
                info!("no station needs watering today");
                return 0;
            }
            plan.parsed_start_times()
        };

        for time in start_times {
            let Some(at) = at_local(now.timezone(), today, time) else {
                continue;
            };
            let Ok(delay) = (at - now).to_std() else {
                continue;
            };
            if delay.is_zero() {
                continue;
            }
            let engine = Arc::clone(self);
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Detached so re-arming never aborts a cycle in progress.
                tokio::spawn(async move {
                    engine.run_watering_cycle().await;
                });
            }));
            info!(at = %format_timestamp(&at), "watering scheduled");
        }
        timers.len()
    }

    /// Water every station with minutes this month, one after another,
    /// for as long as each still needs. Stops early when a run is
    /// interrupted.
    pub async fn run_watering_cycle(self: &Arc<Self>) -> Vec<RunOutcome> {
        info!("running scheduled watering cycle");
        if !self.needs_watering_today().await {
            info!("nothing owed today, skipping watering cycle");
            return Vec::new();
        }
        let now = self.clock.now();

        let stations: Vec<u8> = {
            let st = self.state.read().await;
            if st.controller == PowerState::Off {
                info!("controller is off, skipping watering cycle");
                return Vec::new();
            }
            if let Some(threshold) = st.config.soil_moisture_threshold() {
                match st.soil_moisture {
                    Some(m) if m >= threshold => {
                        info!(moisture = m, threshold, "soil moisture above threshold, skipping watering");
                        return Vec::new();
                    }
                    Some(m) => debug!(moisture = m, threshold, "soil moisture below threshold"),
                    None => warn!("soil moisture unknown, proceeding with watering"),
                }
            }
            st.schedule
                .month_plan(now.date_naive())
                .station_minutes
                .iter()
                .filter(|(_, minutes)| **minutes > 0)
                .map(|(station, _)| *station)
                .collect()
        };

        let mut outcomes = Vec::new();
        for station in stations {
            let minutes = {
                let st = self.state.read().await;
                let i = usize::from(station) - 1;
                let cal = st.calibration(station);
                let target = st.ledger.sprinkle_target_mm.get(i).copied().unwrap_or(0.0);
                let applied = st.ledger.sprinkle_applied_mm.get(i).copied().unwrap_or(0.0);
                dosing::minutes_to_apply(
                    target,
                    applied,
                    st.ledger.rain_depth_forecast_mm,
                    cal.flow_rate_l_per_min,
                    cal.area_m2,
                )
            };
            if minutes == 0 {
                info!(station, "station already received enough water");
                continue;
            }
            if minutes > MAX_RUN_MINUTES {
                warn!(station, minutes, max = MAX_RUN_MINUTES, "run too long, clamping");
            }
            let minutes = minutes.min(MAX_RUN_MINUTES);

            info!(station, minutes, "station will irrigate");
            let handle = match self
                .start_irrigation(station, Some(minutes), RunReason::Schedule)
                .await
            {
                Ok(h) => h,
                Err(CommandError::Cancelled(_)) => {
                    info!("watering cycle interrupted");
                    break;
                }
                Err(e) => {
                    warn!(station, "scheduled start failed: {e}");
                    continue;
                }
            };
            match handle.await {
                Ok(outcome) => {
                    let completed = outcome.completed;
                    outcomes.push(outcome);
                    if !completed {
                        info!("watering cycle interrupted");
                        break;
                    }
                }
                Err(e) => error!(station, "irrigation task failed: {e}"),
            }
        }
        outcomes
    }

    // -- Valve commands -------------------------------------------------------

    /// Open `station` for `minutes` (default: the manual duration) and
    /// spawn its accrual task. On actuator failure nothing changes.
    pub async fn start_irrigation(
        self: &Arc<Self>,
        station: u8,
        minutes: Option<u32>,
        reason: RunReason,
    ) -> Result<JoinHandle<RunOutcome>, CommandError> {
        let minutes = {
            let st = self.state.read().await;
            check_station(station, st.station_count())?;
            if st.station_state(station) == Some(StationState::Sprinkling) {
                return Err(CommandError::Busy(station));
            }
            minutes.unwrap_or(st.manual_duration_min)
        };
        if !(1..=MAX_RUN_MINUTES).contains(&minutes) {
            return Err(ConfigError::OutOfRange {
                field: "run minutes",
                value: f64::from(minutes),
                min: 1.0,
                max: f64::from(MAX_RUN_MINUTES),
            }
            .into());
        }

        info!(station, minutes, reason = reason.as_str(), "starting irrigation");
        // Subscribed before the valve opens so a concurrent stop is not missed.
        let stop_rx = self.stop_tx.subscribe();
        if let Err(e) = self.valve().await.open(station, minutes).await {
            error!(station, "failed to start irrigation: {e}");
            self.record_error(format!("station {station}: start failed: {e}"))
                .await;
            return Err(e.into());
        }

        // A stop issued while the open was in flight wins.
        if stop_rx.has_changed().unwrap_or(true) {
            warn!(station, "stop arrived while opening, closing valve");
            if let Err(e) = self.valve().await.close().await {
                error!(station, "failed to close valve after cancelled start: {e}");
                self.record_error(format!("station {station}: close after cancelled start failed: {e}"))
                    .await;
            }
            self.record_event(
                EventKind::Irrigation,
                format!("station {station} start cancelled by stop"),
            )
            .await;
            return Err(CommandError::Cancelled(station));
        }

        let started = self.clock.now();
        {
            let mut st = self.state.write().await;
            st.set_station(station, StationState::Sprinkling);
            st.record_event(
                &started,
                EventKind::Irrigation,
                format!("station {station} sprinkling for {minutes} min ({})", reason.as_str()),
            );
        }
        self.commit().await;

        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine
                .accrue(station, minutes, reason, started, stop_rx)
                .await
        }))
    }

    /// Per-second credit for one run until it completes or a stop arrives.
    async fn accrue(
        self: Arc<Self>,
        station: u8,
        minutes: u32,
        reason: RunReason,
        started: Timestamp,
        mut stop_rx: watch::Receiver<u64>,
    ) -> RunOutcome {
        let total = u64::from(minutes) * 60;
        let mut ticker = tokio::time::interval(self.tick);
        ticker.tick().await;

        let mut seconds = 0u64;
        let mut applied_mm = 0.0;
        let mut liters = 0.0;
        let completed = loop {
            if seconds >= total {
                break true;
            }
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break false,
                _ = ticker.tick() => {
                    let mut st = self.state.write().await;
                    let cal = st.calibration(station);
                    let mm = cal.mm_per_minute() / 60.0;
                    let l = cal.flow_rate_l_per_min / 60.0;
                    st.ledger.record_sprinkle_progress(station, mm, l);
                    applied_mm += mm;
                    liters += l;
                    seconds += 1;
                }
            }
        };

        let ended = self.clock.now();
        let result = if completed { "completed" } else { "interrupted" };
        let id = {
            let mut st = self.state.write().await;
            st.set_station(station, StationState::Stopped);
            st.ledger.last_sprinkle = Some(ended);
            st.record_event(
                &ended,
                EventKind::Irrigation,
                format!("station {station} {result} after {seconds}s ({applied_mm:.2} mm)"),
            );
            st.config.controller_id()
        };
        info!(station, seconds, applied_mm, result, "irrigation finished");
        self.commit().await;

        let event = WateringEvent {
            station,
            ts_start: format_timestamp(&started),
            ts_end: format_timestamp(&ended),
            minutes,
            applied_mm: dosing::round2(applied_mm),
            liters: dosing::round2(liters),
            reason: reason.as_str().to_string(),
            result: result.to_string(),
        };
        if let Err(e) = self.db.insert_watering_event(&id, &event).await {
            error!(station, "failed to record watering event: {e:#}");
        }

        RunOutcome {
            station,
            seconds,
            applied_mm,
            completed,
        }
    }

    /// Close the valves, then cancel every running accrual task.
    pub async fn stop_irrigation(&self) -> Result<(), CommandError> {
        info!("stopping irrigation");
        if let Err(e) = self.valve().await.close().await {
            error!("failed to stop irrigation: {e}");
            self.record_error(format!("stop failed: {e}")).await;
            return Err(e.into());
        }
        self.stop_tx.send_modify(|generation| *generation = generation.wrapping_add(1));

        let now = self.clock.now();
        {
            let mut st = self.state.write().await;
            st.stop_all();
            st.record_event(&now, EventKind::Irrigation, "all stations stopped".into());
        }
        self.commit().await;
        Ok(())
    }

    pub async fn turn_controller_on(&self) -> Result<(), CommandError> {
        self.set_power(PowerState::On).await
    }

    pub async fn turn_controller_off(&self) -> Result<(), CommandError> {
        self.set_power(PowerState::Off).await
    }

    async fn set_power(&self, power: PowerState) -> Result<(), CommandError> {
        info!(?power, "switching controller");
        let valve = self.valve().await;
        let result = match power {
            PowerState::On => valve.power_on().await,
            PowerState::Off => valve.power_off().await,
        };
        if let Err(e) = result {
            error!(?power, "failed to switch controller: {e}");
            self.record_error(format!("power {power:?} failed: {e}")).await;
            return Err(e.into());
        }

        let now = self.clock.now();
        {
            let mut st = self.state.write().await;
            st.controller = power;
            st.record_event(&now, EventKind::Command, format!("controller {power:?}"));
        }
        self.commit().await;
        Ok(())
    }

    // -- Settings commands ----------------------------------------------------

    /// Replace all twelve month plans. Takes effect for targets at the next
    /// daily reset; today's timers are re-armed now.
    pub async fn set_schedule(self: &Arc<Self>, months: Vec<MonthPlan>) -> Result<(), CommandError> {
        let now = self.clock.now();
        {
            let mut st = self.state.write().await;
            let stations = st.station_count();
            st.schedule.set_schedule(months, stations)?;
            st.record_event(&now, EventKind::Command, "schedule replaced".into());
        }
        info!("schedule replaced");
        self.commit().await;
        self.check_and_schedule_watering().await;
        Ok(())
    }

    pub async fn set_manual_duration(&self, minutes: u32) -> Result<(), CommandError> {
        let minutes = check_manual_duration(minutes)?;
        self.state.write().await.manual_duration_min = minutes;
        info!(minutes, "manual duration set");
        self.commit().await;
        Ok(())
    }

    pub async fn set_flow_rate(&self, station: u8, value: f64) -> Result<(), CommandError> {
        {
            let mut st = self.state.write().await;
            check_station(station, st.station_count())?;
            let value = check_flow_rate(value)?;
            st.flow_rates[usize::from(station) - 1] = value;
        }
        info!(station, value, "flow rate set");
        self.commit().await;
        Ok(())
    }

    /// Swap in a new config: collaborators are rebuilt and every
    /// per-station vector is resized. The timezone is fixed for the life of
    /// the process.
    pub async fn reconfigure(self: &Arc<Self>, config: ControllerConfig) -> Result<(), CommandError> {
        config.validate()?;
        if config.tz() != self.clock.tz() {
            return Err(ConfigError::Invalid(vec![format!(
                "timezone cannot change at runtime (running in {})",
                self.clock.tz()
            )])
            .into());
        }

        let links = (self.connector)(&config).map_err(|e| CommandError::Connect(format!("{e:#}")))?;
        *self.links.write().await = links;

        let now = self.clock.now();
        {
            let mut st = self.state.write().await;
            let before = st.station_count();
            st.apply_config(config);
            let after = st.station_count();
            st.record_event(
                &now,
                EventKind::Command,
                format!("reconfigured ({before} -> {after} stations)"),
            );
        }
        info!("controller reconfigured");
        self.commit().await;
        self.check_and_schedule_watering().await;
        Ok(())
    }

    // -- External inputs ------------------------------------------------------

    /// Latest soil-moisture reading in percent.
    pub async fn set_soil_moisture(&self, percent: f64) {
        debug!(percent, "soil moisture reading");
        self.state.write().await.soil_moisture = Some(percent);
    }

    pub async fn set_mqtt_connected(&self, connected: bool) {
        self.state.write().await.mqtt_connected = connected;
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn reset_day(st: &mut EngineState, now: &Timestamp, forecast_rain_mm: f64) {
    let targets = st.targets_for(now.date_naive());
    info!(?targets, forecast_rain_mm, "daily reset");
    st.ledger.reset_daily(*now, forecast_rain_mm, targets);
    st.record_event(now, EventKind::System, "daily counters reset".into());
}

/// When the next watering is expected, or `None` when no month has start
/// times.
///
/// Starts from today, pushed out by the interval when rain is observed or
/// forecast, and to `last event + interval` when that is later; then skips
/// to a month that has start times and picks the first start time still in
/// the future, falling back to the first start time of the following day.
pub fn next_watering_date(st: &EngineState, now: &Timestamp) -> Option<Timestamp> {
    let today = now.date_naive();
    let tz = now.timezone();
    let plan = st.schedule.next_configured_month(today)?;
    let interval = chrono::Duration::days(i64::from(plan.interval_days));
    let l = &st.ledger;

    let mut day = if l.has_rained_today || l.will_rain_today || l.is_raining_now {
        today + interval
    } else {
        today
    };
    if let Some(last) = l.last_event() {
        let last_day = last.date_naive();
        if today - last_day < interval {
            day = last_day + interval;
        }
    }

    for _ in 0..366 {
        if st.schedule.month_plan(day).has_start_times() {
            break;
        }
        day = day.succ_opt()?;
    }

    let times = plan.parsed_start_times();
    for time in &times {
        if let Some(at) = at_local(tz, day, *time) {
            if at > *now {
                return Some(at);
            }
        }
    }
    at_local(tz, day.succ_opt()?, *times.first()?)
}

// ===========================================================================
// Tests
// ===========================================================================
