//! Valve box control. Commands are encoded as fixed binary frames and
//! written through a [`FrameLink`]; in mock mode nothing leaves the process
//! and commands are only logged.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;

/// Every command frame starts with this big-endian word.
const FRAME_PREFIX: u16 = 0x3105;

/// Written after each command to make the box apply it.
pub const COMMIT_FRAME: [u8; 2] = [0x3b, 0x00];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuatorError {
    #[error("valve box unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ValveActuator: Send + Sync {
    async fn open(&self, station: u8, minutes: u32) -> Result<(), ActuatorError>;
    async fn close(&self) -> Result<(), ActuatorError>;
    async fn power_on(&self) -> Result<(), ActuatorError>;
    async fn power_off(&self) -> Result<(), ActuatorError>;
}

pub type SharedActuator = Arc<dyn ValveActuator>;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveCommand {
    Sprinkle { station: u8, minutes: u32 },
    Stop,
    /// Off until switched back on.
    PowerOff,
    PowerOn,
}

impl ValveCommand {
    /// `>HBBBH`: prefix, opcode, two arguments, seconds.
    pub fn frame(&self) -> [u8; 7] {
        let (op, a, b, seconds) = match *self {
            ValveCommand::Sprinkle { station, minutes } => {
                // The box counts in u16 seconds; longer runs saturate.
                let secs = u16::try_from(minutes.saturating_mul(60)).unwrap_or(u16::MAX);
                (0x12, station, 0x00, secs)
            }
            ValveCommand::Stop => (0x15, 0x00, 0xff, 0),
            ValveCommand::PowerOff => (0xc0, 0x00, 0x00, 0),
            ValveCommand::PowerOn => (0xa0, 0x00, 0x01, 0),
        };
        let [p0, p1] = FRAME_PREFIX.to_be_bytes();
        let [s0, s1] = seconds.to_be_bytes();
        [p0, p1, op, a, b, s0, s1]
    }
}

impl std::fmt::Display for ValveCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValveCommand::Sprinkle { station, minutes } => {
                write!(f, "sprinkle station {station} for {minutes} min")
            }
            ValveCommand::Stop => write!(f, "stop"),
            ValveCommand::PowerOff => write!(f, "power off"),
            ValveCommand::PowerOn => write!(f, "power on"),
        }
    }
}

// ---------------------------------------------------------------------------
// Linked valve (frames over a transport)
// ---------------------------------------------------------------------------

/// Byte transport to the valve box.
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// Deliver `frames` in order as one session.
    async fn write_frames(&self, frames: &[&[u8]]) -> std::io::Result<()>;
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .min_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        exp.min(self.max_backoff)
    }
}

pub struct LinkedValve<L> {
    link: L,
    device: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<L: FrameLink> LinkedValve<L> {
    pub fn new(link: L, device: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            link,
            device: device.to_string(),
            timeout,
            retry,
        }
    }

    async fn send(&self, cmd: ValveCommand) -> Result<(), ActuatorError> {
        let frame = cmd.frame();
        let mut last_err = String::new();

        for attempt in 1..=self.retry.attempts.max(1) {
            debug!(device = %self.device, attempt, "valve: writing {cmd}");
            let frames: [&[u8]; 2] = [&frame, &COMMIT_FRAME];
            let write = self.link.write_frames(&frames);
            match tokio::time::timeout(self.timeout, write).await {
                Ok(Ok(())) => {
                    info!(device = %self.device, "valve: {cmd}");
                    return Ok(());
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = format!("timed out after {}s", self.timeout.as_secs()),
            }
            warn!(device = %self.device, attempt, error = %last_err, "valve: {cmd} failed");
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }

        Err(ActuatorError::Unavailable(format!(
            "{}: {cmd}: {last_err}",
            self.device
        )))
    }
}

#[async_trait]
impl<L: FrameLink> ValveActuator for LinkedValve<L> {
    async fn open(&self, station: u8, minutes: u32) -> Result<(), ActuatorError> {
        self.send(ValveCommand::Sprinkle { station, minutes }).await
    }

    async fn close(&self) -> Result<(), ActuatorError> {
        self.send(ValveCommand::Stop).await
    }

    async fn power_on(&self) -> Result<(), ActuatorError> {
        self.send(ValveCommand::PowerOn).await
    }

    async fn power_off(&self) -> Result<(), ActuatorError> {
        self.send(ValveCommand::PowerOff).await
    }
}

/// Frame bridge reachable over TCP; one connection per command.
pub struct TcpLink {
    addr: String,
}

impl TcpLink {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl FrameLink for TcpLink {
    async fn write_frames(&self, frames: &[&[u8]]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        for f in frames {
            stream.write_all(f).await?;
        }
        stream.flush().await?;
        stream.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Mock valve (no hardware, logs commands)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockValve {
    commands: Mutex<Vec<ValveCommand>>,
    fail: AtomicBool,
}

impl MockValve {
    pub fn new() -> Self {
        info!("[mock-valve] valve box initialised (no hardware)");
        Self::default()
    }

    /// Make every following command fail with `Unavailable`.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<ValveCommand> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn record(&self, cmd: ValveCommand) -> Result<(), ActuatorError> {
        if self.fail.load(Ordering::SeqCst) {
            warn!("[mock-valve] {cmd} refused");
            return Err(ActuatorError::Unavailable("mock valve set to fail".into()));
        }
        info!("[mock-valve] {cmd}");
        if let Ok(mut c) = self.commands.lock() {
            c.push(cmd);
        }
        Ok(())
    }
}

#[async_trait]
impl ValveActuator for MockValve {
    async fn open(&self, station: u8, minutes: u32) -> Result<(), ActuatorError> {
        self.record(ValveCommand::Sprinkle { station, minutes })
    }

    async fn close(&self) -> Result<(), ActuatorError> {
        self.record(ValveCommand::Stop)
    }

    async fn power_on(&self) -> Result<(), ActuatorError> {
        self.record(ValveCommand::PowerOn)
    }

    async fn power_off(&self) -> Result<(), ActuatorError> {
        self.record(ValveCommand::PowerOff)
    }
}

/// Actuator for `cfg`: the mock in mock mode, otherwise frames over TCP to
/// the configured bridge.
pub fn connect(cfg: &ControllerConfig) -> SharedActuator {
    match (cfg.mock, cfg.bridge_addr.as_deref()) {
        (false, Some(addr)) => Arc::new(LinkedValve::new(
            TcpLink::new(addr),
            &cfg.device_address,
            Duration::from_secs(cfg.actuator_timeout_secs),
            RetryPolicy::default(),
        )),
        (false, None) => {
            warn!(device = %cfg.device_address, "no bridge_addr configured, using mock valve");
            Arc::new(MockValve::new())
        }
        (true, _) => Arc::new(MockValve::new()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    // -- Frames -------------------------------------------------------------

    #[test]
    fn sprinkle_frame_layout() {
        let f = ValveCommand::Sprinkle {
            station: 2,
            minutes: 10,
        }
        .frame();
        // 600 s = 0x0258
        assert_eq!(f, [0x31, 0x05, 0x12, 0x02, 0x00, 0x02, 0x58]);
    }

    #[test]
    fn stop_frame_layout() {
        assert_eq!(
            ValveCommand::Stop.frame(),
            [0x31, 0x05, 0x15, 0x00, 0xff, 0x00, 0x00]
        );
    }

    #[test]
    fn power_frames() {
        assert_eq!(
            ValveCommand::PowerOff.frame(),
            [0x31, 0x05, 0xc0, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            ValveCommand::PowerOn.frame(),
            [0x31, 0x05, 0xa0, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn long_sprinkle_saturates_seconds() {
        let f = ValveCommand::Sprinkle {
            station: 1,
            minutes: 2000,
        }
        .frame();
        assert_eq!(&f[5..], &[0xff, 0xff]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(4), Duration::from_secs(10));
    }

    // -- MockValve ----------------------------------------------------------

    #[tokio::test]
    async fn mock_records_commands_in_order() {
        let v = MockValve::new();
        v.open(1, 5).await.unwrap();
        v.close().await.unwrap();
        v.power_off().await.unwrap();
        v.power_on().await.unwrap();
        assert_eq!(
            v.commands(),
            vec![
                ValveCommand::Sprinkle {
                    station: 1,
                    minutes: 5
                },
                ValveCommand::Stop,
                ValveCommand::PowerOff,
                ValveCommand::PowerOn,
            ]
        );
    }

    #[tokio::test]
    async fn mock_failure_records_nothing() {
        let v = MockValve::new();
        v.set_failing(true);
        assert!(matches!(
            v.open(1, 5).await,
            Err(ActuatorError::Unavailable(_))
        ));
        assert!(v.commands().is_empty());
    }

    // -- LinkedValve --------------------------------------------------------

    /// Fails the first `failures` sessions, then records frames.
    #[derive(Default)]
    struct FlakyLink {
        failures: u32,
        calls: AtomicU32,
        written: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl FrameLink for FlakyLink {
        async fn write_frames(&self, frames: &[&[u8]]) -> std::io::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "device not found",
                ));
            }
            let mut w = self.written.lock().unwrap();
            w.extend(frames.iter().map(|f| f.to_vec()));
            Ok(())
        }
    }

    fn linked(failures: u32) -> LinkedValve<FlakyLink> {
        LinkedValve::new(
            FlakyLink {
                failures,
                ..Default::default()
            },
            "C8:B9:61:00:12:34",
            Duration::from_secs(15),
            RetryPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn linked_writes_command_then_commit() {
        let v = linked(0);
        v.open(3, 1).await.unwrap();
        let w = v.link.written.lock().unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], ValveCommand::Sprinkle { station: 3, minutes: 1 }.frame().to_vec());
        assert_eq!(w[1], COMMIT_FRAME.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn linked_retries_until_success() {
        let v = linked(3);
        v.close().await.unwrap();
        assert_eq!(v.link.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn linked_gives_up_after_attempts() {
        let v = linked(10);
        let err = v.power_on().await.unwrap_err();
        assert!(err.to_string().contains("device not found"), "{err}");
        assert_eq!(v.link.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn connect_uses_mock_in_mock_mode() {
        let cfg: ControllerConfig =
            toml::from_str("device_address = \"C8:B9:61:00:12:34\"\nmock = true\n").unwrap();
        // Only checks construction does not touch the network.
        let _actuator = connect(&cfg);
    }
}
