mod clock;
mod config;
mod db;
mod dosing;
mod engine;
mod ledger;
mod mqtt;
mod schedule;
mod snapshot;
mod state;
mod valve;
mod weather;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use db::Db;
use engine::{connect_links, Engine};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let device = cfg.controller_id();
    let soil_topic = cfg.soil_moisture.as_ref().map(|s| s.topic.clone());
    let clock = Arc::new(SystemClock::new(cfg.tz()));
    info!(
        device = %cfg.device_address,
        stations = cfg.stations,
        timezone = %cfg.timezone,
        mock = cfg.mock,
        "config loaded"
    );
    if cfg.weather.is_none() {
        warn!("no weather section configured, rain tracking disabled");
    }

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Engine ──────────────────────────────────────────────────────
    let engine = Engine::open(cfg, db, clock, Box::new(connect_links)).await?;
    let _tasks = engine.start().await;

    // ── Web server ──────────────────────────────────────────────────
    let web_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_engine).await {
            error!("http api stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = format!("irrigation-{device}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    tokio::spawn(mqtt::publish_status(
        client.clone(),
        device.clone(),
        engine.subscribe(),
    ));

    mqtt::run(engine, client, eventloop, device, soil_topic).await;
    Ok(())
}
