//! Channels
//!
//! A channel is a session bound to one transport and protocol pairing. All
//! five pairings share the lifecycle contract in [`ChannelLifecycle`]; the
//! command groups they support are exposed as optional capabilities (see
//! [`capabilities`]). [`Channel`] is the closed set of pairings the
//! connection manager owns, one at a time.
//!
//! Channels report lifecycle changes as [`ChannelEvent`]s over the sender
//! injected at construction. `Closed` is sent at most once per open, no
//! matter how many paths notice the loss.

pub mod capabilities;
pub mod http;
pub mod sacp;
pub mod text_serial;

use async_trait::async_trait;
use fablink_core::{
    AirPurifierState, DisconnectReason, EnclosureState, HeadType, MachineSeries, Position,
    Protocol, Result, WorkflowStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub use capabilities::{
    AirPurifierCapability, CncCapability, EnclosureCapability, FileTransferCapability,
    GcodeCapability, LaserCapability, MotionCapability, NetworkCapability, PrintJobCapability,
    PrintRequest, ProgressCallback, SystemCapability, TemperatureCapability,
};
pub use http::{HttpChannel, HttpChannelConfig, HttpStatus};
pub use sacp::{SacpChannel, SacpChannelConfig, SacpTransport};
pub use text_serial::TextSerialChannel;

/// What the machine told us once the session became usable
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadyInfo {
    /// Protocol of the session.
    pub protocol: Protocol,
    /// Machine family.
    pub series: MachineSeries,
    /// Tool head, when the protocol reports it up front.
    pub head_type: HeadType,
    /// Controller firmware, when known.
    pub firmware_version: Option<String>,
}

/// Channel lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport is open.
    Connected,
    /// Session is usable.
    Ready(ReadyInfo),
    /// Session ended.
    Closed(DisconnectReason),
}

/// Where a channel sends its lifecycle events
pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Event sender with the at-most-once `Closed` guard
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: ChannelEventSender,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(tx: ChannelEventSender) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Allow one `Closed` for the session starting now
    pub(crate) fn arm(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Swallow any later `Closed`; used when an open attempt fails
    pub(crate) fn disarm(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Channel event dropped, nobody listens");
        }
    }

    /// Send `Closed` unless it was already sent; returns whether it was sent
    pub(crate) fn closed(&self, reason: DisconnectReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(ChannelEvent::Closed(reason));
        true
    }
}

/// Lifecycle contract of every channel
#[async_trait]
pub trait ChannelLifecycle: Send + Sync {
    /// Protocol this channel speaks
    fn protocol(&self) -> Protocol;

    /// Whether a session is open
    fn is_open(&self) -> bool;

    /// Open the transport and start the session; `Ready` follows on success
    async fn connection_open(&self) -> Result<()>;

    /// Graceful close with the protocol's goodbye; false if nothing was open
    async fn connection_close(&self) -> Result<bool>;

    /// Immediate teardown without any exchange with the machine
    async fn connection_close_improper(&self);

    /// Start liveness tracking
    async fn start_heartbeat(&self) -> Result<()>;

    /// Stop liveness tracking
    async fn stop_heartbeat(&self);
}

/// One telemetry sample from a legacy protocol
///
/// Fields the sample does not carry are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LegacySample {
    /// Workflow status.
    pub status: Option<WorkflowStatus>,
    /// Work position.
    pub position: Option<Position>,
    /// Homed flag.
    pub is_homed: Option<bool>,
    /// Nozzle current and target in °C.
    pub nozzle: Option<(f64, f64)>,
    /// Bed current and target in °C.
    pub bed: Option<(f64, f64)>,
    /// Laser power in percent.
    pub laser_power: Option<f64>,
    /// Spindle speed in RPM.
    pub spindle_speed: Option<u32>,
    /// Enclosure state.
    pub enclosure: Option<EnclosureState>,
    /// Air purifier state.
    pub air_purifier: Option<AirPurifierState>,
    /// Line of the running job.
    pub current_line: Option<u32>,
    /// Seconds the running job has taken.
    pub elapsed_secs: Option<u64>,
}

const LEGACY_TELEMETRY_CAPACITY: usize = 64;

/// Fan-out of legacy telemetry samples
#[derive(Debug, Clone)]
pub struct LegacyTelemetry {
    tx: broadcast::Sender<LegacySample>,
}

impl Default for LegacyTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyTelemetry {
    /// Create an empty fan-out
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LEGACY_TELEMETRY_CAPACITY);
        Self { tx }
    }

    /// Receive samples published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LegacySample> {
        self.tx.subscribe()
    }

    /// Publish a sample
    pub fn publish(&self, sample: LegacySample) {
        let _ = self.tx.send(sample);
    }
}

/// The channel the manager currently owns
#[derive(Clone)]
pub enum Channel {
    /// Plain G-code over a serial port.
    TextSerial(Arc<TextSerialChannel>),
    /// Binary protocol over a serial port.
    SacpSerial(Arc<SacpChannel>),
    /// Binary protocol over TCP.
    SacpTcp(Arc<SacpChannel>),
    /// Binary protocol over UDP.
    SacpUdp(Arc<SacpChannel>),
    /// Screen firmware REST API.
    Http(Arc<HttpChannel>),
}

impl Channel {
    /// Wrap a binary-protocol channel in the variant of its transport
    pub fn sacp(channel: SacpChannel) -> Self {
        let transport = channel.transport();
        let channel = Arc::new(channel);
        match transport {
            SacpTransport::Serial => Self::SacpSerial(channel),
            SacpTransport::Tcp => Self::SacpTcp(channel),
            SacpTransport::Udp => Self::SacpUdp(channel),
        }
    }

    /// Lifecycle half of the channel
    pub fn lifecycle(&self) -> &dyn ChannelLifecycle {
        match self {
            Self::TextSerial(c) => c.as_ref(),
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => c.as_ref(),
            Self::Http(c) => c.as_ref(),
        }
    }

    /// Protocol of the channel
    pub fn protocol(&self) -> Protocol {
        self.lifecycle().protocol()
    }

    /// The binary-protocol channel, if this is one
    pub fn as_sacp(&self) -> Option<&Arc<SacpChannel>> {
        match self {
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c),
            _ => None,
        }
    }

    /// Telemetry fan-out of legacy channels
    pub fn legacy_telemetry(&self) -> Option<LegacyTelemetry> {
        match self {
            Self::TextSerial(c) => Some(c.telemetry()),
            Self::Http(c) => Some(c.telemetry()),
            _ => None,
        }
    }

    /// Raw G-code execution, available on every channel
    pub fn gcode(&self) -> Option<&dyn GcodeCapability> {
        match self {
            Self::TextSerial(c) => Some(c.as_ref()),
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c.as_ref()),
            Self::Http(c) => Some(c.as_ref()),
        }
    }

    /// File upload to machine storage
    pub fn file_transfer(&self) -> Option<&dyn FileTransferCapability> {
        match self {
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c.as_ref()),
            Self::Http(c) => Some(c.as_ref()),
            Self::TextSerial(_) => None,
        }
    }

    /// Firmware version and log export
    pub fn system(&self) -> Option<&dyn SystemCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn SystemCapability)
    }

    /// Wi-Fi configuration
    pub fn network(&self) -> Option<&dyn NetworkCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn NetworkCapability)
    }

    /// Print start, pause, resume and stop
    pub fn print_job(&self) -> Option<&dyn PrintJobCapability> {
        match self {
            Self::TextSerial(c) => Some(c.as_ref()),
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c.as_ref()),
            Self::Http(c) => Some(c.as_ref()),
        }
    }

    /// Homing, moves and work origin
    pub fn motion(&self) -> Option<&dyn MotionCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn MotionCapability)
    }

    /// Nozzle and bed heaters
    pub fn temperature(&self) -> Option<&dyn TemperatureCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn TemperatureCapability)
    }

    /// Spindle control
    pub fn cnc(&self) -> Option<&dyn CncCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn CncCapability)
    }

    /// Laser power, crosshair and fire sensor
    pub fn laser(&self) -> Option<&dyn LaserCapability> {
        self.as_sacp().map(|c| c.as_ref() as &dyn LaserCapability)
    }

    /// Enclosure light, fan and door detection
    pub fn enclosure(&self) -> Option<&dyn EnclosureCapability> {
        match self {
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c.as_ref()),
            Self::Http(c) => Some(c.as_ref()),
            Self::TextSerial(_) => None,
        }
    }

    /// Air purifier switch and fan speed
    pub fn air_purifier(&self) -> Option<&dyn AirPurifierCapability> {
        match self {
            Self::SacpSerial(c) | Self::SacpTcp(c) | Self::SacpUdp(c) => Some(c.as_ref()),
            Self::Http(c) => Some(c.as_ref()),
            Self::TextSerial(_) => None,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("protocol", &self.protocol())
            .field("open", &self.lifecycle().is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_sent_once_per_arm() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        assert!(!sink.closed(DisconnectReason::UserRequested));

        sink.arm();
        assert!(sink.closed(DisconnectReason::HeartbeatTimeout));
        assert!(!sink.closed(DisconnectReason::UserRequested));
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Closed(DisconnectReason::HeartbeatTimeout)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disarm_swallows_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.arm();
        sink.disarm();
        assert!(!sink.closed(DisconnectReason::UserRequested));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_legacy_telemetry_fan_out() {
        let telemetry = LegacyTelemetry::new();
        let mut a = telemetry.subscribe();
        let mut b = telemetry.subscribe();
        telemetry.publish(LegacySample {
            status: Some(WorkflowStatus::Running),
            ..Default::default()
        });
        assert_eq!(a.recv().await.unwrap().status, Some(WorkflowStatus::Running));
        assert_eq!(b.recv().await.unwrap().status, Some(WorkflowStatus::Running));
    }
}
