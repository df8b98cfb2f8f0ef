use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::db::RunReason;
use crate::engine::{CommandError, Engine};
use crate::schedule::MonthPlan;

const DEFAULT_RUNS_LIMIT: i64 = 50;

type AppState = Arc<Engine>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/runs", get(api_runs))
        .route("/api/stations/{station}/start", post(api_start))
        .route("/api/stations/{station}/flow-rate", put(api_flow_rate))
        .route("/api/stop", post(api_stop))
        .route("/api/controller/on", post(api_on))
        .route("/api/controller/off", post(api_off))
        .route("/api/schedule", put(api_schedule))
        .route("/api/manual-duration", put(api_manual_duration))
        .route("/api/reconfigure", post(api_reconfigure))
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError(CommandError);

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CommandError::Config(_) => StatusCode::BAD_REQUEST,
            CommandError::Busy(_) | CommandError::Cancelled(_) => StatusCode::CONFLICT,
            CommandError::Actuator(_) => StatusCode::BAD_GATEWAY,
            CommandError::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        warn!(status = status.as_u16(), "command rejected: {}", self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn ok() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(engine): State<AppState>) -> impl IntoResponse {
    Json(engine.status().await)
}

#[derive(Deserialize)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn api_runs(State(engine): State<AppState>, Query(q): Query<RunsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, 1000);
    match engine.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => {
            error!("loading watering history failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "history unavailable" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartBody {
    minutes: Option<u32>,
}

/// Body is optional; without one the manual duration applies.
async fn api_start(
    State(engine): State<AppState>,
    Path(station): Path<u8>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, Response> {
    let body: StartBody = if body.iter().all(u8::is_ascii_whitespace) {
        StartBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid body: {e}") })),
            )
                .into_response()
        })?
    };
    engine
        .start_irrigation(station, body.minutes, RunReason::Manual)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    Ok(ok())
}

async fn api_stop(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    engine.stop_irrigation().await?;
    Ok(ok())
}

async fn api_on(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    engine.turn_controller_on().await?;
    Ok(ok())
}

async fn api_off(State(engine): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    engine.turn_controller_off().await?;
    Ok(ok())
}

async fn api_schedule(
    State(engine): State<AppState>,
    Json(months): Json<Vec<MonthPlan>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine.set_schedule(months).await?;
    Ok(ok())
}

#[derive(Deserialize)]
struct MinutesBody {
    minutes: u32,
}

async fn api_manual_duration(
    State(engine): State<AppState>,
    Json(body): Json<MinutesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine.set_manual_duration(body.minutes).await?;
    Ok(ok())
}

#[derive(Deserialize)]
struct FlowRateBody {
    value: f64,
}

async fn api_flow_rate(
    State(engine): State<AppState>,
    Path(station): Path<u8>,
    Json(body): Json<FlowRateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine.set_flow_rate(station, body.value).await?;
    Ok(ok())
}

async fn api_reconfigure(
    State(engine): State<AppState>,
    Json(config): Json<ControllerConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine.reconfigure(config).await?;
    Ok(ok())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(engine: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(engine))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ts, FixedClock};
    use crate::db::Db;
    use crate::engine::{Connector, Links};
    use crate::state::StationState;
    use crate::valve::{MockValve, SharedActuator};
    use axum::body::Body;
    use axum::http::Request;
    use chrono_tz::Tz;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn config(stations: u8) -> ControllerConfig {
        ControllerConfig {
            device_address: "AA:BB:CC:DD:EE:FF".into(),
            stations,
            sprinkle_with_rain: false,
            station_areas: vec![],
            timezone: "UTC".into(),
            poll_interval_secs: 60,
            actuator_timeout_secs: 15,
            mock: true,
            bridge_addr: None,
            soil_moisture: None,
            weather: None,
        }
    }

    async fn app() -> (Router, Arc<Engine>, Arc<MockValve>) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let valve = Arc::new(MockValve::new());
        let v = Arc::clone(&valve);
        let connector: Connector = Box::new(move |_cfg: &ControllerConfig| {
            Ok(Links {
                valve: v.clone() as SharedActuator,
                weather: None,
            })
        });
        let clock = Arc::new(FixedClock::at(ts(Tz::UTC, "2024-06-10 10:00:00")));
        let engine = Engine::open(config(2), db, clock, connector).await.unwrap();
        (router(Arc::clone(&engine)), engine, valve)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn status_lists_every_station() {
        let (app, _, _) = app().await;
        let (status, body) = send(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(body["stations"].as_array().unwrap().len(), 2);
        assert_eq!(body["controller"], "on");
    }

    #[tokio::test]
    async fn start_without_body_uses_manual_duration() {
        let (app, engine, valve) = app().await;
        let (status, _) = send(&app, "POST", "/api/stations/2/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            engine.status().await.stations[1].state,
            StationState::Sprinkling
        );
        assert_eq!(
            valve.commands(),
            vec![crate::valve::ValveCommand::Sprinkle {
                station: 2,
                minutes: 10
            }]
        );

        let (status, _) = send(&app, "POST", "/api/stations/2/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn start_with_minutes() {
        let (app, _, valve) = app().await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/stations/1/start",
            Some(json!({ "minutes": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            valve.commands(),
            vec![crate::valve::ValveCommand::Sprinkle {
                station: 1,
                minutes: 3
            }]
        );
    }

    #[tokio::test]
    async fn invalid_station_is_bad_request() {
        let (app, _, valve) = app().await;
        let (status, body) = send(&app, "POST", "/api/stations/3/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("station 3"));

        let (status, _) = send(
            &app,
            "PUT",
            "/api/stations/0/flow-rate",
            Some(json!({ "value": 10.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(valve.commands().is_empty());
    }

    #[tokio::test]
    async fn actuator_failure_is_bad_gateway() {
        let (app, engine, valve) = app().await;
        valve.set_failing(true);
        let (status, _) = send(&app, "POST", "/api/controller/off", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            engine.status().await.controller,
            crate::state::PowerState::On
        );
    }

    #[tokio::test]
    async fn settings_round_trip_through_status() {
        let (app, _, _) = app().await;

        let (status, _) = send(&app, "PUT", "/api/manual-duration", Some(json!({ "minutes": 61 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "PUT", "/api/manual-duration", Some(json!({ "minutes": 25 }))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/stations/2/flow-rate",
            Some(json!({ "value": 0.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(
            &app,
            "PUT",
            "/api/stations/2/flow-rate",
            Some(json!({ "value": 8.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", "/api/status", None).await;
        assert_eq!(body["manual_duration_min"], 25);
        assert_eq!(body["stations"][1]["flow_rate_l_per_min"], 8.0);
    }

    #[tokio::test]
    async fn schedule_must_have_twelve_months() {
        let (app, _, _) = app().await;
        let eleven = serde_json::to_value(vec![MonthPlan::empty(2); 11]).unwrap();
        let (status, _) = send(&app, "PUT", "/api/schedule", Some(eleven)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let twelve = serde_json::to_value(vec![MonthPlan::empty(2); 12]).unwrap();
        let (status, _) = send(&app, "PUT", "/api/schedule", Some(twelve)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn reconfigure_grows_stations() {
        let (app, _, _) = app().await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/reconfigure",
            Some(serde_json::to_value(config(4)).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, "GET", "/api/status", None).await;
        assert_eq!(body["stations"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn stop_and_runs_history() {
        let (app, _, _) = app().await;
        send(&app, "POST", "/api/stations/1/start", Some(json!({ "minutes": 5 }))).await;
        let (status, _) = send(&app, "POST", "/api/stop", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stations"][0]["state"], "stopped");

        let (status, body) = send(&app, "GET", "/api/runs?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_array());
    }
}
