//! Binary-protocol channel
//!
//! Serial, TCP, and UDP share this implementation; only the session setup
//! differs:
//! - Serial writes the mode switch (`M2000 U5`) before framing starts, and
//!   prints by streaming G-code batches the machine pulls.
//! - TCP runs the session handshake and primes the heartbeat before `Ready`.
//! - UDP has no transport close at all, so it primes the heartbeat too and
//!   relies on the same watchdog for liveness.
//!
//! Every variant confirms the session with a machine-info request; its
//! answer carries the series reported in `Ready`.

use super::capabilities::{
    AirPurifierCapability, CncCapability, EnclosureCapability, FileTransferCapability,
    GcodeCapability, LaserCapability, MotionCapability, NetworkCapability, PrintJobCapability,
    PrintRequest, ProgressCallback, SystemCapability, TemperatureCapability,
};
use super::{ChannelEvent, ChannelEventSender, ChannelLifecycle, EventSink, ReadyInfo};
use crate::link::LinkOpener;
use crate::sacp::buffer::PayloadWriter;
use crate::sacp::client::{HandshakeInfo, SacpClient};
use crate::sacp::commands::{print, RESULT_OK};
use crate::sacp::dispatcher::{Dispatcher, DispatcherConfig, SubscriptionId};
use crate::sacp::telemetry::{GcodeBatchRequest, Heartbeat, MachineInfo, NetworkInfo, Telemetry};
use crate::sacp::transfer::{FileTransfer, TransferMode, DEFAULT_CHUNK_SIZE};
use crate::watch::{ConnectionWatchConfig, ConnectionWatcher};
use async_trait::async_trait;
use fablink_core::{
    Axis, ChannelError, ConnectionError, DisconnectReason, HeadType, ModuleKind, ModuleTable,
    Protocol, Result, WorkflowStatus,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Written to serial firmware to switch it into binary mode
pub const SERIAL_MODE_SWITCH: &[u8] = b"M2000 U5\r\n";

/// Transport under a binary-protocol channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SacpTransport {
    /// Serial port.
    Serial,
    /// TCP socket.
    Tcp,
    /// Connected UDP socket.
    Udp,
}

impl SacpTransport {
    /// Protocol this transport carries
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Serial => Protocol::SacpOverSerial,
            Self::Tcp => Protocol::SacpOverTcp,
            Self::Udp => Protocol::SacpOverUdp,
        }
    }
}

/// Session settings
#[derive(Debug, Clone)]
pub struct SacpChannelConfig {
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// Heartbeat watchdog.
    pub watch: ConnectionWatchConfig,
    /// Push interval requested for the heartbeat.
    pub heartbeat_interval_ms: u16,
    /// Identity sent in the TCP handshake.
    pub handshake: HandshakeInfo,
    /// Bound on the goodbye exchange of a graceful close.
    pub disconnect_timeout: Duration,
    /// Pause after the serial mode switch.
    pub mode_switch_delay: Duration,
    /// How uploads are encoded.
    pub transfer_mode: TransferMode,
    /// Bytes per upload chunk.
    pub chunk_size: usize,
}

impl Default for SacpChannelConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            watch: ConnectionWatchConfig::default(),
            heartbeat_interval_ms: 1000,
            handshake: HandshakeInfo::default(),
            disconnect_timeout: Duration::from_secs(2),
            mode_switch_delay: Duration::from_millis(100),
            transfer_mode: TransferMode::Direct,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

struct Session {
    client: SacpClient,
    info: Option<MachineInfo>,
    heartbeat: Option<SubscriptionId>,
    monitor: JoinHandle<()>,
}

/// Binary-protocol session over serial, TCP, or UDP
pub struct SacpChannel {
    transport: SacpTransport,
    opener: Arc<dyn LinkOpener>,
    config: SacpChannelConfig,
    sink: EventSink,
    watcher: Arc<ConnectionWatcher>,
    status: Arc<watch::Sender<WorkflowStatus>>,
    session: Mutex<Option<Session>>,
    modules: RwLock<ModuleTable>,
    open_lock: tokio::sync::Mutex<()>,
}

impl SacpChannel {
    /// Create a closed channel
    pub fn new(
        transport: SacpTransport,
        opener: Arc<dyn LinkOpener>,
        config: SacpChannelConfig,
        events: ChannelEventSender,
    ) -> Self {
        let (status, _) = watch::channel(WorkflowStatus::Unknown);
        Self {
            transport,
            opener,
            watcher: Arc::new(ConnectionWatcher::new(config.watch)),
            config,
            sink: EventSink::new(events),
            status: Arc::new(status),
            session: Mutex::new(None),
            modules: RwLock::new(ModuleTable::default()),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Transport in use
    pub fn transport(&self) -> SacpTransport {
        self.transport
    }

    /// Settings in use
    pub fn config(&self) -> &SacpChannelConfig {
        &self.config
    }

    /// Client of the open session
    pub fn client(&self) -> Result<SacpClient> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| !s.client.dispatcher().is_closed())
            .map(|s| s.client.clone())
            .ok_or_else(|| ChannelError::NotOpen.into())
    }

    /// Machine info answered when the session opened
    pub fn machine_info(&self) -> Option<MachineInfo> {
        self.session.lock().as_ref().and_then(|s| s.info.clone())
    }

    /// Workflow status from the heartbeat
    pub fn status(&self) -> watch::Receiver<WorkflowStatus> {
        self.status.subscribe()
    }

    /// Last discovered modules
    pub fn modules(&self) -> ModuleTable {
        self.modules.read().clone()
    }

    /// Query the attached modules and replace the table
    pub async fn refresh_modules(&self) -> Result<ModuleTable> {
        let modules = self.client()?.get_module_info().await?;
        let table = ModuleTable::new(modules);
        tracing::info!("Modules on {}: {:?}", self.opener.describe(), table.summary());
        *self.modules.write() = table.clone();
        Ok(table)
    }

    fn module_key(&self, kind: ModuleKind, name: &str) -> Result<u8> {
        self.modules
            .read()
            .find(kind)
            .map(|m| m.key)
            .ok_or_else(|| {
                ChannelError::ModuleMissing {
                    module: name.to_string(),
                }
                .into()
            })
    }

    fn spawn_monitor(&self, dispatcher: &Dispatcher) -> JoinHandle<()> {
        let closed = dispatcher.closed();
        let sink = self.sink.clone();
        let watcher = self.watcher.clone();
        let target = self.opener.describe();
        tokio::spawn(async move {
            let cause = closed.await;
            watcher.stop().await;
            if sink.closed(cause.disconnect_reason()) {
                tracing::warn!("Session with {} ended: {}", target, cause);
            }
        })
    }

    async fn establish(&self, client: &SacpClient) -> Result<MachineInfo> {
        if self.transport == SacpTransport::Tcp {
            client
                .handshake(&self.config.handshake)
                .await
                .map_err(|e| ConnectionError::HandshakeRejected {
                    reason: e.to_string(),
                })?;
            tracing::debug!("Handshake with {} accepted", self.opener.describe());
        }
        if self.transport != SacpTransport::Serial {
            self.start_heartbeat().await?;
        }
        client.get_machine_info().await
    }

    async fn teardown(&self, graceful: bool) -> bool {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return false;
        };
        self.watcher.stop().await;
        let dispatcher = session.client.dispatcher().clone();
        if let Some(id) = session.heartbeat {
            if graceful && !dispatcher.is_closed() {
                if let Err(e) = dispatcher.unsubscribe(Heartbeat::TAG, id).await {
                    tracing::debug!("Heartbeat unsubscribe failed: {}", e);
                }
            }
        }
        if graceful && self.transport == SacpTransport::Tcp && !dispatcher.is_closed() {
            if let Err(e) = session.client.disconnect(self.config.disconnect_timeout).await {
                tracing::debug!("Disconnect request to {} failed: {}", dispatcher.peer(), e);
            }
        }
        self.sink.closed(DisconnectReason::UserRequested);
        session.monitor.abort();
        dispatcher.close().await;
        self.modules.write().clear();
        self.status.send_replace(WorkflowStatus::Unknown);
        true
    }

    async fn start_streamed_print(&self, client: &SacpClient, request: &PrintRequest) -> Result<()> {
        let lines: Arc<Vec<String>> = Arc::new(
            request
                .content
                .lines()
                .map(|l| l.trim_end().to_string())
                .collect(),
        );
        let total = u32::try_from(lines.len()).map_err(|_| ChannelError::InvalidArgument {
            reason: format!("{} has too many lines to stream", request.filename),
        })?;

        let dispatcher = client.dispatcher();
        dispatcher.set_handler(print::REQUEST_GCODE, move |d, packet| {
            let reply = match GcodeBatchRequest::from_request(&packet.payload) {
                Ok(batch) => gcode_batch_reply(&lines, batch),
                Err(e) => {
                    tracing::warn!("Malformed G-code batch request: {}", e);
                    vec![1]
                }
            };
            if let Err(e) = d.ack(&packet, reply) {
                tracing::warn!("Could not answer G-code batch request: {}", e);
            }
        });

        if let Err(e) = client
            .start_print(&request.filename, print::SOURCE_STREAM, total)
            .await
        {
            dispatcher.remove_handler(print::REQUEST_GCODE);
            return Err(e);
        }
        tracing::info!("Streaming {} ({} lines)", request.filename, total);
        Ok(())
    }
}

/// Answer to a batch pull: result, start line, count, newline-joined lines
///
/// A start past the end answers an empty batch.
pub fn gcode_batch_reply(lines: &[String], batch: GcodeBatchRequest) -> Vec<u8> {
    let start = (batch.start_line as usize).min(lines.len());
    let end = start.saturating_add(usize::from(batch.count)).min(lines.len());
    let slice = &lines[start..end];
    PayloadWriter::new()
        .u8(RESULT_OK)
        .u32(batch.start_line)
        .u16(slice.len() as u16)
        .string(&slice.join("\n"))
        .finish()
}

#[async_trait]
impl ChannelLifecycle for SacpChannel {
    fn protocol(&self) -> Protocol {
        self.transport.protocol()
    }

    fn is_open(&self) -> bool {
        self.client().is_ok()
    }

    async fn connection_open(&self) -> Result<()> {
        let _guard = self.open_lock.lock().await;
        if self.teardown(false).await {
            tracing::debug!("Dropped stale session before reopening");
        }

        let target = self.opener.describe();
        tracing::info!("Opening {} on {}", self.protocol(), target);
        let link = self.opener.open().await?;

        if self.transport == SacpTransport::Serial {
            link.writer.write_all(SERIAL_MODE_SWITCH).await?;
            tokio::time::sleep(self.config.mode_switch_delay).await;
        }

        let dispatcher = Dispatcher::start(link, self.config.dispatcher.clone());
        let client = SacpClient::new(dispatcher.clone());
        self.sink.arm();
        let monitor = self.spawn_monitor(&dispatcher);
        *self.session.lock() = Some(Session {
            client: client.clone(),
            info: None,
            heartbeat: None,
            monitor,
        });
        self.sink.emit(ChannelEvent::Connected);

        match self.establish(&client).await {
            Ok(info) => {
                tracing::info!(
                    "{} ready: {} firmware {}",
                    target,
                    info.series,
                    info.firmware_version
                );
                let ready = ReadyInfo {
                    protocol: self.protocol(),
                    series: info.series,
                    head_type: HeadType::Unknown,
                    firmware_version: Some(info.firmware_version.clone()),
                };
                if let Some(session) = self.session.lock().as_mut() {
                    session.info = Some(info);
                }
                self.sink.emit(ChannelEvent::Ready(ready));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Session setup with {} failed: {}", target, e);
                self.sink.disarm();
                self.teardown(false).await;
                Err(e)
            }
        }
    }

    async fn connection_close(&self) -> Result<bool> {
        let _guard = self.open_lock.lock().await;
        Ok(self.teardown(true).await)
    }

    async fn connection_close_improper(&self) {
        self.teardown(false).await;
    }

    async fn start_heartbeat(&self) -> Result<()> {
        let client = self.client()?;
        if self
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.heartbeat.is_some())
        {
            return Ok(());
        }

        let sink = self.sink.clone();
        let dispatcher = client.dispatcher().clone();
        self.watcher
            .start(move || {
                if sink.closed(DisconnectReason::HeartbeatTimeout) {
                    tracing::error!("Heartbeat lost on {}", dispatcher.peer());
                }
                tokio::spawn(async move { dispatcher.close().await });
            })
            .await?;

        let watcher = self.watcher.clone();
        let status = self.status.clone();
        let id = client
            .subscribe::<Heartbeat, _>(self.config.heartbeat_interval_ms, move |beat| {
                watcher.heartbeat();
                status.send_if_modified(|current| {
                    let next = beat.status();
                    let changed = *current != next;
                    *current = next;
                    changed
                });
            })
            .await;
        let id = match id {
            Ok(id) => id,
            Err(e) => {
                self.watcher.stop().await;
                return Err(e);
            }
        };
        if let Some(session) = self.session.lock().as_mut() {
            session.heartbeat = Some(id);
        }
        tracing::debug!("Heartbeat started on {}", self.opener.describe());
        Ok(())
    }

    async fn stop_heartbeat(&self) {
        self.watcher.stop().await;
        let taken = {
            let mut session = self.session.lock();
            session
                .as_mut()
                .and_then(|s| s.heartbeat.take().map(|id| (s.client.clone(), id)))
        };
        if let Some((client, id)) = taken {
            if let Err(e) = client.dispatcher().unsubscribe(Heartbeat::TAG, id).await {
                tracing::debug!("Heartbeat unsubscribe failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl GcodeCapability for SacpChannel {
    async fn execute_gcode(&self, gcode: &str) -> Result<String> {
        self.client()?.execute_gcode(gcode).await
    }
}

#[async_trait]
impl FileTransferCapability for SacpChannel {
    async fn upload_file(
        &self,
        filename: &str,
        content: Vec<u8>,
        on_progress: ProgressCallback,
    ) -> Result<()> {
        let client = self.client()?;
        let transfer = FileTransfer::new(
            filename,
            content,
            self.config.transfer_mode,
            self.config.chunk_size,
        )?;
        client.upload(transfer, move |p| on_progress(p)).await
    }
}

#[async_trait]
impl SystemCapability for SacpChannel {
    async fn firmware_version(&self) -> Result<String> {
        Ok(self.client()?.get_machine_info().await?.firmware_version)
    }

    async fn export_log(&self) -> Result<()> {
        self.client()?.export_log().await
    }
}

#[async_trait]
impl NetworkCapability for SacpChannel {
    async fn get_network_config(&self) -> Result<NetworkInfo> {
        self.client()?.get_network_config().await
    }

    async fn set_network_config(&self, ssid: &str, password: &str) -> Result<()> {
        self.client()?.set_network_config(ssid, password).await
    }
}

#[async_trait]
impl PrintJobCapability for SacpChannel {
    async fn start_print(&self, request: &PrintRequest) -> Result<()> {
        let client = self.client()?;
        if self.transport == SacpTransport::Serial {
            return self.start_streamed_print(&client, request).await;
        }
        let noop: ProgressCallback = Arc::new(|_| {});
        self.upload_file(&request.filename, request.content.as_bytes().to_vec(), noop)
            .await?;
        client
            .start_print(
                &request.filename,
                print::SOURCE_STORED,
                request.metadata.total_lines,
            )
            .await
    }

    async fn pause_print(&self) -> Result<()> {
        self.client()?.pause_print().await
    }

    async fn resume_print(&self) -> Result<()> {
        self.client()?.resume_print().await
    }

    async fn stop_print(&self) -> Result<()> {
        let client = self.client()?;
        client.dispatcher().remove_handler(print::REQUEST_GCODE);
        client.stop_print().await
    }
}

#[async_trait]
impl MotionCapability for SacpChannel {
    async fn move_to(&self, axes: &[(Axis, f64)], feed_rate: u16) -> Result<()> {
        self.client()?.move_to(axes, feed_rate).await
    }

    async fn home(&self) -> Result<()> {
        self.client()?.home().await
    }

    async fn set_work_origin(&self, axes: &[(Axis, f64)]) -> Result<()> {
        self.client()?.set_work_origin(axes).await
    }
}

#[async_trait]
impl TemperatureCapability for SacpChannel {
    async fn set_nozzle_temperature(&self, extruder: u8, celsius: u16) -> Result<()> {
        let key = self.module_key(ModuleKind::PrintingHead, "printing head")?;
        self.client()?
            .set_nozzle_temperature(key, extruder, celsius)
            .await
    }

    // Beds never appear in the module list; the firmware addresses them
    // through the key of the printing head they are paired with.
    async fn set_bed_temperature(&self, zone: u8, celsius: u16) -> Result<()> {
        let key = self.module_key(ModuleKind::PrintingHead, "printing head")?;
        self.client()?.set_bed_temperature(key, zone, celsius).await
    }
}

#[async_trait]
impl CncCapability for SacpChannel {
    async fn set_spindle_speed(&self, rpm: u32) -> Result<()> {
        let key = self.module_key(ModuleKind::CncHead, "CNC head")?;
        self.client()?.set_spindle_speed(key, rpm).await
    }

    async fn switch_spindle(&self, on: bool) -> Result<()> {
        let key = self.module_key(ModuleKind::CncHead, "CNC head")?;
        self.client()?.switch_spindle(key, on).await
    }
}

#[async_trait]
impl LaserCapability for SacpChannel {
    async fn set_laser_power(&self, percent: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(ChannelError::InvalidArgument {
                reason: format!("laser power {} outside 0-100", percent),
            }
            .into());
        }
        let key = self.module_key(ModuleKind::LaserHead, "laser head")?;
        self.client()?.set_laser_power(key, percent).await
    }

    async fn set_crosshair(&self, on: bool) -> Result<()> {
        let key = self.module_key(ModuleKind::LaserHead, "laser head")?;
        self.client()?.set_crosshair(key, on).await
    }

    async fn set_fire_sensor_sensitivity(&self, value: u16) -> Result<()> {
        let key = self.module_key(ModuleKind::LaserHead, "laser head")?;
        self.client()?.set_fire_sensor_sensitivity(key, value).await
    }
}

#[async_trait]
impl EnclosureCapability for SacpChannel {
    async fn set_enclosure_light(&self, intensity: u8) -> Result<()> {
        let key = self.module_key(ModuleKind::Enclosure, "enclosure")?;
        self.client()?.set_enclosure_light(key, intensity).await
    }

    async fn set_enclosure_fan(&self, speed: u8) -> Result<()> {
        let key = self.module_key(ModuleKind::Enclosure, "enclosure")?;
        self.client()?.set_enclosure_fan(key, speed).await
    }

    async fn set_door_detection(&self, enabled: bool) -> Result<()> {
        let key = self.module_key(ModuleKind::Enclosure, "enclosure")?;
        self.client()?.set_door_detection(key, enabled).await
    }
}

#[async_trait]
impl AirPurifierCapability for SacpChannel {
    async fn switch_purifier(&self, on: bool) -> Result<()> {
        let key = self.module_key(ModuleKind::AirPurifier, "air purifier")?;
        self.client()?.switch_purifier(key, on).await
    }

    async fn set_purifier_speed(&self, level: u8) -> Result<()> {
        let key = self.module_key(ModuleKind::AirPurifier, "air purifier")?;
        self.client()?.set_purifier_speed(key, level).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLinkOpener;
    use crate::sacp::buffer::PayloadReader;
    use crate::sacp::commands::{bed, laser, system};
    use crate::testing::{module, FakeMachine};
    use fablink_core::MachineSeries;
    use tokio::sync::mpsc;

    fn quick_config() -> SacpChannelConfig {
        SacpChannelConfig {
            watch: ConnectionWatchConfig {
                timeout_ms: 300,
                check_interval_ms: 20,
            },
            mode_switch_delay: Duration::from_millis(1),
            disconnect_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn channel(
        transport: SacpTransport,
        config: SacpChannelConfig,
    ) -> (
        SacpChannel,
        Arc<MockLinkOpener>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let opener = Arc::new(MockLinkOpener::new("sacp"));
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = SacpChannel::new(transport, opener.clone(), config, tx);
        (channel, opener, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_serial_open_switches_mode() {
        let (channel, opener, mut events) = channel(SacpTransport::Serial, quick_config());
        let machine = FakeMachine::attach(&opener).with_series(MachineSeries::A250);

        channel.connection_open().await.unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        match next_event(&mut events).await {
            ChannelEvent::Ready(info) => {
                assert_eq!(info.protocol, Protocol::SacpOverSerial);
                assert_eq!(info.series, MachineSeries::A250);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(machine.raw_text().contains("M2000 U5"));
        assert_eq!(machine.count(system::HANDSHAKE), 0);
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_tcp_open_handshakes_and_primes_heartbeat() {
        let (channel, opener, _events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener);

        channel.connection_open().await.unwrap();
        let tags = machine.received_tags();
        let handshake = tags.iter().position(|t| *t == system::HANDSHAKE).unwrap();
        let subscribe = tags.iter().position(|t| *t == system::SUBSCRIBE).unwrap();
        let info = tags.iter().position(|t| *t == system::MACHINE_INFO).unwrap();
        assert!(handshake < subscribe && subscribe < info);
    }

    #[tokio::test]
    async fn test_rejected_handshake_fails_open() {
        let (channel, opener, mut events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener);
        machine.respond(system::HANDSHAKE, vec![3]);

        let err = channel.connection_open().await.unwrap_err();
        assert!(matches!(
            err,
            fablink_core::Error::Connection(ConnectionError::HandshakeRejected { .. })
        ));
        assert!(!channel.is_open());
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_closes_once() {
        let (channel, opener, mut events) = channel(SacpTransport::Udp, quick_config());
        let _machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::HeartbeatTimeout)
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(events.try_recv().is_err());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_heartbeats_drive_status() {
        let (channel, opener, mut events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();
        let mut status = channel.status();

        for _ in 0..10 {
            assert!(machine.push(&Heartbeat { code: 2 }).await);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(*status.borrow_and_update(), WorkflowStatus::Running);
        assert!(channel.is_open());
        next_event(&mut events).await;
        next_event(&mut events).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_loss_reports_connection_lost() {
        let (channel, opener, mut events) = channel(SacpTransport::Serial, quick_config());
        let machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        machine.close(Some("cable pulled")).await;
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::ConnectionLost("cable pulled".to_string()))
        );
    }

    #[tokio::test]
    async fn test_graceful_close_says_goodbye() {
        let (channel, opener, mut events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();

        assert!(channel.connection_close().await.unwrap());
        assert_eq!(machine.count(system::DISCONNECT), 1);
        assert!(!channel.connection_close().await.unwrap());

        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Closed(DisconnectReason::UserRequested)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_improper_close_skips_goodbye() {
        let (channel, opener, _events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();
        channel.connection_close_improper().await;
        assert_eq!(machine.count(system::DISCONNECT), 0);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_laser_commands_need_laser_module() {
        let (channel, opener, _events) = channel(SacpTransport::Serial, quick_config());
        let machine = FakeMachine::attach(&opener).with_modules(vec![module(7, 14, 0)]);
        channel.connection_open().await.unwrap();

        let err = channel.set_laser_power(40.0).await.unwrap_err();
        assert!(matches!(
            err,
            fablink_core::Error::Channel(ChannelError::ModuleMissing { .. })
        ));

        channel.refresh_modules().await.unwrap();
        channel.set_laser_power(40.0).await.unwrap();
        let packet = machine.wait_for(laser::SET_POWER).await.unwrap();
        let mut r = PayloadReader::new(&packet.payload);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.milli().unwrap(), 40.0);
        assert!(channel.set_laser_power(140.0).await.is_err());
    }

    #[tokio::test]
    async fn test_bed_temperature_uses_printing_head_key() {
        let (channel, opener, _events) = channel(SacpTransport::Tcp, quick_config());
        let machine = FakeMachine::attach(&opener).with_modules(vec![module(4, 0, 0)]);
        channel.connection_open().await.unwrap();

        let err = channel.set_bed_temperature(0, 60).await.unwrap_err();
        assert!(matches!(
            err,
            fablink_core::Error::Channel(ChannelError::ModuleMissing { .. })
        ));
        assert_eq!(machine.count(bed::SET_TEMPERATURE), 0);

        channel.refresh_modules().await.unwrap();
        channel.set_bed_temperature(1, 60).await.unwrap();
        let packet = machine.wait_for(bed::SET_TEMPERATURE).await.unwrap();
        let mut r = PayloadReader::new(&packet.payload);
        assert_eq!(r.u8().unwrap(), 4);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 60);
    }

    #[tokio::test]
    async fn test_streamed_print_serves_batches() {
        let (channel, opener, _events) = channel(SacpTransport::Serial, quick_config());
        let machine = FakeMachine::attach(&opener);
        channel.connection_open().await.unwrap();

        let request = PrintRequest::new("part.gcode", "G28\nG1 X10\nG1 Y10\n");
        channel.start_print(&request).await.unwrap();
        let start = machine.wait_for(print::START).await.unwrap();
        let mut r = PayloadReader::new(&start.payload);
        assert_eq!(r.string().unwrap(), "part.gcode");
        assert_eq!(r.u8().unwrap(), print::SOURCE_STREAM);
        assert_eq!(r.u32().unwrap(), 3);

        let ack = machine
            .request(
                print::REQUEST_GCODE,
                GcodeBatchRequest {
                    start_line: 1,
                    count: 5,
                }
                .to_request(),
            )
            .await
            .unwrap();
        let mut r = PayloadReader::new(&ack.payload);
        assert_eq!(r.u8().unwrap(), RESULT_OK);
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 2);
        assert_eq!(r.string().unwrap(), "G1 X10\nG1 Y10");
    }

    #[test]
    fn test_batch_past_end_is_empty() {
        let lines = vec!["G28".to_string()];
        let reply = gcode_batch_reply(
            &lines,
            GcodeBatchRequest {
                start_line: 9,
                count: 3,
            },
        );
        let mut r = PayloadReader::new(&reply);
        assert_eq!(r.u8().unwrap(), RESULT_OK);
        assert_eq!(r.u32().unwrap(), 9);
        assert_eq!(r.u16().unwrap(), 0);
        assert_eq!(r.string().unwrap(), "");
    }
}
