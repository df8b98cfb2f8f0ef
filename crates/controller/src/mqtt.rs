use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::db::RunReason;
use crate::engine::{CommandError, Engine};
use crate::state::{EventKind, StatusResponse};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MqttCommand {
    Start { station: u8, minutes: Option<u32> },
    Stop,
    On,
    Off,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "irrigation/<device>/state", retained.
pub(crate) fn state_topic(device: &str) -> String {
    format!("irrigation/{device}/state")
}

/// "irrigation/<device>/cmd/+".
pub(crate) fn command_filter(device: &str) -> String {
    format!("irrigation/{device}/cmd/+")
}

/// Extract the command name from "irrigation/<device>/cmd/<command>".
pub(crate) fn extract_command<'a>(topic: &'a str, device: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4
        && parts[0] == "irrigation"
        && parts[1] == device
        && parts[2] == "cmd"
        && !parts[3].is_empty()
    {
        Some(parts[3])
    } else {
        None
    }
}

/// Parse a command. `start` takes "<station>" or "<station>:<minutes>";
/// the others ignore their payload.
pub(crate) fn parse_command(name: &str, payload: &[u8]) -> Result<MqttCommand, String> {
    let s = String::from_utf8_lossy(payload).trim().to_string();
    match name.to_lowercase().as_str() {
        "start" => {
            let (station, minutes) = match s.split_once(':') {
                Some((st, m)) => (st.trim(), Some(m.trim())),
                None => (s.as_str(), None),
            };
            let station = station
                .parse::<u8>()
                .map_err(|_| format!("invalid station '{station}'"))?;
            let minutes = minutes
                .map(|m| m.parse::<u32>().map_err(|_| format!("invalid minutes '{m}'")))
                .transpose()?;
            Ok(MqttCommand::Start { station, minutes })
        }
        "stop" => Ok(MqttCommand::Stop),
        "on" => Ok(MqttCommand::On),
        "off" => Ok(MqttCommand::Off),
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Soil-moisture payloads are a bare percentage.
pub(crate) fn parse_soil_moisture(payload: &[u8]) -> Result<f64, String> {
    let s = String::from_utf8_lossy(payload).trim().to_string();
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("invalid soil moisture '{s}'")),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn execute(engine: &Arc<Engine>, cmd: MqttCommand) -> Result<(), CommandError> {
    match cmd {
        MqttCommand::Start { station, minutes } => engine
            .start_irrigation(station, minutes, RunReason::Manual)
            .await
            .map(|_| ()),
        MqttCommand::Stop => engine.stop_irrigation().await,
        MqttCommand::On => engine.turn_controller_on().await,
        MqttCommand::Off => engine.turn_controller_off().await,
    }
}

/// Publish every status change, retained, until the engine goes away.
pub async fn publish_status(
    client: AsyncClient,
    device: String,
    mut status: watch::Receiver<Arc<StatusResponse>>,
) {
    let topic = state_topic(&device);
    loop {
        let payload = match serde_json::to_vec(&**status.borrow_and_update()) {
            Ok(p) => p,
            Err(e) => {
                error!("status serialisation failed: {e}");
                Vec::new()
            }
        };
        if !payload.is_empty() {
            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, true, payload).await {
                warn!(%topic, "status publish failed: {e}");
            }
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}

/// Drive the MQTT event loop: (re)subscribe on connect, route commands and
/// soil-moisture readings into the engine.
pub async fn run(
    engine: Arc<Engine>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    device: String,
    soil_topic: Option<String>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();

                if let Some(name) = extract_command(&topic, &device) {
                    match parse_command(name, &p.payload) {
                        Ok(cmd) => {
                            info!(?cmd, "mqtt command");
                            if let Err(e) = execute(&engine, cmd).await {
                                warn!(?cmd, "mqtt command failed: {e}");
                            }
                        }
                        Err(msg) => {
                            warn!(%topic, "{msg}");
                            engine.record_event(EventKind::Error, msg).await;
                        }
                    }
                } else if soil_topic.as_deref() == Some(topic.as_str()) {
                    match parse_soil_moisture(&p.payload) {
                        Ok(v) => engine.set_soil_moisture(v).await,
                        Err(msg) => warn!(%topic, "{msg}"),
                    }
                } else {
                    warn!(%topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = subscribe(&client, &device, soil_topic.as_deref()).await {
                    error!("mqtt subscribe failed: {e}");
                }
                engine.set_mqtt_connected(true).await;
                engine
                    .record_event(EventKind::System, "mqtt connected".into())
                    .await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                engine.set_mqtt_connected(false).await;
                engine
                    .record_event(EventKind::System, "mqtt disconnected".into())
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                engine.set_mqtt_connected(false).await;
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn subscribe(
    client: &AsyncClient,
    device: &str,
    soil_topic: Option<&str>,
) -> Result<(), rumqttc::ClientError> {
    let filter = command_filter(device);
    client.subscribe(&filter, QoS::AtLeastOnce).await?;
    if let Some(t) = soil_topic {
        client.subscribe(t, QoS::AtLeastOnce).await?;
    }
    info!(%filter, soil = ?soil_topic, "mqtt subscribed");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
