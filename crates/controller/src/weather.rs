//! Rain observations and forecasts from OpenWeatherMap.
//!
//! The engine only sees the [`WeatherOracle`] trait. The math that turns a
//! forecast table into "will it rain" and "how much is still coming today"
//! lives in free functions so it can be tested against fixed clocks.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Timelike};
use chrono_tz::Tz;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{at_local, Timestamp};
use crate::config::WeatherConfig;

const CURRENT_URL: &str = "https://api.openweathermap.org/data/2.5/weather";
const FORECAST_URL: &str = "https://api.openweathermap.org/data/2.5/forecast";

/// Forecast blocks are three hours long.
const BLOCK_MINUTES: i64 = 180;

/// Probability of precipitation above which a block counts as rainy.
const POP_THRESHOLD: f64 = 0.5;

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather data invalid: {0}")]
    DataInvalid(String),
    #[error("weather request failed: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Current conditions; `raw` is the provider's payload, kept for status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentConditions {
    pub raining: bool,
    pub raw: Value,
}

impl CurrentConditions {
    /// A payload reports rain when it carries a `rain` object.
    pub fn from_json(raw: Value) -> Result<Self, WeatherError> {
        if !raw.is_object() {
            return Err(WeatherError::DataInvalid(
                "current weather is not a JSON object".into(),
            ));
        }
        let raining = raw.get("rain").is_some();
        Ok(Self { raining, raw })
    }

    /// Rain depth expected during one poll interval, from the first
    /// `rain.<h>h` accumulation in the payload.
    pub fn rain_depth_per_poll(&self, poll_secs: u64) -> f64 {
        let Some(rain) = self.raw.get("rain").and_then(Value::as_object) else {
            return 0.0;
        };
        for (key, amount) in rain {
            let hours = key
                .strip_suffix('h')
                .and_then(|h| h.parse::<u32>().ok())
                .filter(|h| *h > 0);
            if let (Some(hours), Some(mm)) = (hours, amount.as_f64()) {
                return mm / f64::from(hours * 60) * (poll_secs as f64 / 60.0);
            }
        }
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockRain {
    #[serde(rename = "3h", default)]
    pub three_hour_mm: f64,
}

/// One three-hour forecast block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBlock {
    /// Block start, unix seconds.
    pub dt: i64,
    /// Probability of precipitation, 0..=1.
    #[serde(default)]
    pub pop: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain: Option<BlockRain>,
}

impl ForecastBlock {
    pub fn start(&self, tz: Tz) -> Option<Timestamp> {
        chrono::DateTime::from_timestamp(self.dt, 0).map(|t| t.with_timezone(&tz))
    }

    pub fn rain_mm(&self) -> f64 {
        self.rain.as_ref().map(|r| r.three_hour_mm).unwrap_or(0.0)
    }
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    list: Vec<ForecastBlock>,
}

/// Everything one poll needs from the weather side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherReport {
    pub current: CurrentConditions,
    pub forecast: Vec<ForecastBlock>,
    pub will_rain_today: bool,
    pub remaining_rain_mm: f64,
}

// ---------------------------------------------------------------------------
// Forecast math
// ---------------------------------------------------------------------------

/// Blocks that start today and have not ended yet, with the minutes of
/// each still ahead of `now`.
fn remaining_blocks<'a>(
    blocks: &'a [ForecastBlock],
    now: &'a Timestamp,
) -> impl Iterator<Item = (&'a ForecastBlock, i64)> + 'a {
    let tz = now.timezone();
    let today = now.date_naive();
    blocks.iter().filter_map(move |b| {
        let start = b.start(tz)?;
        if start.date_naive() != today {
            return None;
        }
        let end = start + Duration::minutes(BLOCK_MINUTES);
        if end <= *now {
            return None;
        }
        let ahead = if start <= *now {
            (end - *now).num_minutes()
        } else {
            BLOCK_MINUTES
        };
        Some((b, ahead))
    })
}

/// Any block left today, the current one included, with pop above 50%.
pub fn will_rain_today(blocks: &[ForecastBlock], now: &Timestamp) -> bool {
    remaining_blocks(blocks, now).any(|(b, _)| b.pop > POP_THRESHOLD)
}

/// Forecast rain still to fall today; the block in progress is pro-rated
/// by its remaining minutes.
pub fn remaining_rain_today(blocks: &[ForecastBlock], now: &Timestamp) -> f64 {
    remaining_blocks(blocks, now)
        .map(|(b, ahead)| b.rain_mm() * ahead as f64 / BLOCK_MINUTES as f64)
        .sum()
}

/// Fold a fresh fetch into the cached table: same-start blocks are
/// replaced, new ones appended, and blocks that ended before `today` began
/// are dropped.
pub fn merge_forecast(cache: &mut Vec<ForecastBlock>, fresh: Vec<ForecastBlock>, today: NaiveDate, tz: Tz) {
    if let Some(midnight) = at_local(tz, today, chrono::NaiveTime::MIN) {
        cache.retain(|b| {
            b.start(tz)
                .map(|s| s + Duration::minutes(BLOCK_MINUTES) > midnight)
                .unwrap_or(false)
        });
    }
    for block in fresh {
        match cache.iter_mut().find(|b| b.dt == block.dt) {
            Some(existing) => *existing = block,
            None => cache.push(block),
        }
    }
    cache.sort_by_key(|b| b.dt);
}

/// How many forecast blocks to request: the rest of today plus one.
pub fn forecast_block_count(now: &Timestamp) -> usize {
    (0..=21u32).step_by(3).filter(|h| *h >= now.hour()).count() + 1
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherOracle: Send + Sync {
    async fn current(&self, now: &Timestamp) -> Result<CurrentConditions, WeatherError>;

    async fn forecast(&self, now: &Timestamp) -> Result<Vec<ForecastBlock>, WeatherError>;

    /// Preload the forecast table, e.g. from a snapshot. The next call
    /// still fetches.
    async fn seed_forecast(&self, _blocks: Vec<ForecastBlock>) {}

    async fn report(&self, now: &Timestamp) -> Result<WeatherReport, WeatherError> {
        let forecast = self.forecast(now).await?;
        let current = self.current(now).await?;
        Ok(WeatherReport {
            will_rain_today: will_rain_today(&forecast, now),
            remaining_rain_mm: remaining_rain_today(&forecast, now),
            current,
            forecast,
        })
    }
}

#[derive(Default)]
struct WeatherCache {
    current: Option<(Timestamp, CurrentConditions)>,
    forecast: Vec<ForecastBlock>,
    forecast_fetched: Option<Timestamp>,
}

pub struct OpenWeatherMap {
    client: Client,
    api_key: String,
    latitude: f64,
    longitude: f64,
    ttl: Duration,
    cache: Mutex<WeatherCache>,
}

impl OpenWeatherMap {
    pub fn new(cfg: &WeatherConfig, timeout: std::time::Duration) -> Result<Self, WeatherError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            ttl: Duration::minutes(cfg.cache_min as i64),
            cache: Mutex::new(WeatherCache::default()),
        })
    }

    fn fresh(&self, fetched: Option<&Timestamp>, now: &Timestamp) -> bool {
        fetched.map(|t| *now - *t < self.ttl).unwrap_or(false)
    }

    async fn get_json(&self, url: &str, extra: &[(&str, String)]) -> Result<String, WeatherError> {
        let mut query = vec![
            ("appid", self.api_key.clone()),
            ("lat", self.latitude.to_string()),
            ("lon", self.longitude.to_string()),
        ];
        query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        let resp = self.client.get(url).query(&query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WeatherError::DataInvalid(format!("{url} returned {status}")));
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl WeatherOracle for OpenWeatherMap {
    async fn seed_forecast(&self, blocks: Vec<ForecastBlock>) {
        self.cache.lock().await.forecast = blocks;
    }

    async fn current(&self, now: &Timestamp) -> Result<CurrentConditions, WeatherError> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched, current)) = &cache.current {
            if self.fresh(Some(fetched), now) {
                debug!("weather: current conditions from cache");
                return Ok(current.clone());
            }
        }

        let body = self.get_json(CURRENT_URL, &[]).await?;
        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| WeatherError::DataInvalid(format!("current weather: {e}")))?;
        let current = CurrentConditions::from_json(raw)?;
        cache.current = Some((*now, current.clone()));
        Ok(current)
    }

    async fn forecast(&self, now: &Timestamp) -> Result<Vec<ForecastBlock>, WeatherError> {
        let mut cache = self.cache.lock().await;
        if self.fresh(cache.forecast_fetched.as_ref(), now) {
            debug!("weather: forecast from cache");
            return Ok(cache.forecast.clone());
        }

        let cnt = forecast_block_count(now);
        let body = self
            .get_json(
                FORECAST_URL,
                &[("units", "metric".to_string()), ("cnt", cnt.to_string())],
            )
            .await?;
        let parsed: ForecastResponse = serde_json::from_str(&body)
            .map_err(|e| WeatherError::DataInvalid(format!("forecast: {e}")))?;

        merge_forecast(&mut cache.forecast, parsed.list, now.date_naive(), now.timezone());
        cache.forecast_fetched = Some(*now);
        debug!(blocks = cache.forecast.len(), "weather: forecast refreshed");
        Ok(cache.forecast.clone())
    }
}

// ---------------------------------------------------------------------------
// Test oracle
// ---------------------------------------------------------------------------

/// Canned weather for engine tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticWeather {
    pub current: std::sync::Mutex<CurrentConditions>,
    pub forecast: std::sync::Mutex<Vec<ForecastBlock>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl StaticWeather {
    pub fn raining(mm_per_hour: f64) -> Self {
        let w = Self::default();
        w.set_current(serde_json::json!({ "rain": { "1h": mm_per_hour } }));
        w
    }

    pub fn set_current(&self, raw: Value) {
        *self.current.lock().unwrap() = CurrentConditions::from_json(raw).unwrap();
    }
}

#[cfg(test)]
#[async_trait]
impl WeatherOracle for StaticWeather {
    async fn current(&self, _now: &Timestamp) -> Result<CurrentConditions, WeatherError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(WeatherError::DataInvalid("static failure".into()));
        }
        Ok(self.current.lock().unwrap().clone())
    }

    async fn forecast(&self, _now: &Timestamp) -> Result<Vec<ForecastBlock>, WeatherError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(WeatherError::DataInvalid("static failure".into()));
        }
        Ok(self.forecast.lock().unwrap().clone())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ts;
    use serde_json::json;

    fn block(tz: Tz, start: &str, pop: f64, rain: Option<f64>) -> ForecastBlock {
        ForecastBlock {
            dt: ts(tz, start).timestamp(),
            pop,
            rain: rain.map(|mm| BlockRain { three_hour_mm: mm }),
        }
    }

    fn day_table(tz: Tz) -> Vec<ForecastBlock> {
        vec![
            block(tz, "2024-06-10 09:00:00", 0.1, None),
            block(tz, "2024-06-10 12:00:00", 0.2, Some(3.0)),
            block(tz, "2024-06-10 15:00:00", 0.8, Some(6.0)),
            block(tz, "2024-06-10 18:00:00", 0.3, Some(1.5)),
            block(tz, "2024-06-11 00:00:00", 0.9, Some(9.0)),
        ]
    }

    // -- will_rain_today --------------------------------------------------

    #[test]
    fn rainy_block_later_today() {
        let now = ts(Tz::UTC, "2024-06-10 13:30:00");
        assert!(will_rain_today(&day_table(Tz::UTC), &now));
    }

    #[test]
    fn rainy_block_already_over() {
        let now = ts(Tz::UTC, "2024-06-10 18:10:00");
        assert!(!will_rain_today(&day_table(Tz::UTC), &now));
    }

    #[test]
    fn tomorrow_does_not_count() {
        let now = ts(Tz::UTC, "2024-06-10 21:00:00");
        assert!(!will_rain_today(&day_table(Tz::UTC), &now));
    }

    #[test]
    fn pop_exactly_half_is_dry() {
        let now = ts(Tz::UTC, "2024-06-10 09:00:00");
        let blocks = vec![block(Tz::UTC, "2024-06-10 12:00:00", 0.5, Some(1.0))];
        assert!(!will_rain_today(&blocks, &now));
    }

    // -- remaining_rain_today ---------------------------------------------

    #[test]
    fn current_block_is_pro_rated() {
        // 13:30: 90 of 180 minutes left in the 12:00 block.
        let now = ts(Tz::UTC, "2024-06-10 13:30:00");
        let mm = remaining_rain_today(&day_table(Tz::UTC), &now);
        assert!((mm - (1.5 + 6.0 + 1.5)).abs() < 1e-9, "{mm}");
    }

    #[test]
    fn nothing_left_at_end_of_day() {
        let now = ts(Tz::UTC, "2024-06-10 21:00:00");
        assert_eq!(remaining_rain_today(&day_table(Tz::UTC), &now), 0.0);
    }

    #[test]
    fn local_dates_decide_today() {
        // 23:00 UTC on the 9th is 00:00 Lisbon (summer) on the 10th.
        let tz = chrono_tz::Europe::Lisbon;
        let blocks = vec![ForecastBlock {
            dt: ts(Tz::UTC, "2024-06-09 23:00:00").timestamp(),
            pop: 0.9,
            rain: Some(BlockRain { three_hour_mm: 3.0 }),
        }];
        let now = ts(tz, "2024-06-10 01:00:00");
        assert!(will_rain_today(&blocks, &now));
        assert!((remaining_rain_today(&blocks, &now) - 2.0).abs() < 1e-9);
    }

    // -- merge_forecast ---------------------------------------------------

    #[test]
    fn merge_replaces_appends_and_prunes() {
        let tz = Tz::UTC;
        let mut cache = vec![
            block(tz, "2024-06-09 18:00:00", 0.9, Some(2.0)),
            block(tz, "2024-06-09 21:00:00", 0.9, Some(2.0)),
            block(tz, "2024-06-10 00:00:00", 0.1, None),
        ];
        let fresh = vec![
            block(tz, "2024-06-10 00:00:00", 0.7, Some(1.0)),
            block(tz, "2024-06-10 03:00:00", 0.2, None),
        ];
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        merge_forecast(&mut cache, fresh, today, tz);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache[0].pop, 0.7);
        assert_eq!(cache[1].dt, ts(tz, "2024-06-10 03:00:00").timestamp());
    }

    #[test]
    fn block_count_covers_rest_of_day() {
        assert_eq!(forecast_block_count(&ts(Tz::UTC, "2024-06-10 00:10:00")), 9);
        assert_eq!(forecast_block_count(&ts(Tz::UTC, "2024-06-10 13:00:00")), 4);
        assert_eq!(forecast_block_count(&ts(Tz::UTC, "2024-06-10 22:00:00")), 1);
    }

    // -- Current conditions -----------------------------------------------

    #[test]
    fn rain_key_means_raining() {
        let c = CurrentConditions::from_json(json!({"rain": {"1h": 1.2}, "dt": 1})).unwrap();
        assert!(c.raining);
        let c = CurrentConditions::from_json(json!({"weather": [], "dt": 1})).unwrap();
        assert!(!c.raining);
    }

    #[test]
    fn non_object_payload_is_invalid() {
        let err = CurrentConditions::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, WeatherError::DataInvalid(_)));
    }

    #[test]
    fn depth_per_poll_from_hourly_rate() {
        // 3 mm over the last hour, 60 s poll → 0.05 mm.
        let c = CurrentConditions::from_json(json!({"rain": {"1h": 3.0}})).unwrap();
        assert!((c.rain_depth_per_poll(60) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn depth_per_poll_from_three_hour_total() {
        let c = CurrentConditions::from_json(json!({"rain": {"3h": 9.0}})).unwrap();
        assert!((c.rain_depth_per_poll(120) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn depth_zero_without_usable_key() {
        let c = CurrentConditions::from_json(json!({"rain": {"total": 4.0}})).unwrap();
        assert_eq!(c.rain_depth_per_poll(60), 0.0);
        assert_eq!(CurrentConditions::default().rain_depth_per_poll(60), 0.0);
    }

    // -- Wire format ------------------------------------------------------

    #[test]
    fn parses_forecast_response() {
        let body = r#"{"cod":"200","cnt":2,"list":[
            {"dt":1718020800,"main":{"temp":20.1},"pop":0.64,"rain":{"3h":2.4},"dt_txt":"2024-06-10 12:00:00"},
            {"dt":1718031600,"main":{"temp":19.0},"pop":0,"dt_txt":"2024-06-10 15:00:00"}]}"#;
        let parsed: ForecastResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.list.len(), 2);
        assert_eq!(parsed.list[0].rain_mm(), 2.4);
        assert_eq!(parsed.list[1].rain_mm(), 0.0);
        assert_eq!(parsed.list[1].pop, 0.0);
    }

    #[tokio::test]
    async fn report_combines_current_and_forecast() {
        let w = StaticWeather::raining(1.0);
        *w.forecast.lock().unwrap() = day_table(Tz::UTC);
        let now = ts(Tz::UTC, "2024-06-10 13:30:00");
        let r = w.report(&now).await.unwrap();
        assert!(r.current.raining);
        assert!(r.will_rain_today);
        assert!((r.remaining_rain_mm - 9.0).abs() < 1e-9);
    }
}
