//! Simulated machines
//!
//! [`FakeMachine`] speaks the binary protocol on the far end of a mock link:
//! it decodes every frame the host writes, records it, and answers it from a
//! per-tag responder table. [`FakeMarlin`] does the same for the text
//! protocol. Both let the dispatcher, channels, and manager run end to end
//! without hardware; [`ScriptedFactory`] hands the manager channels wired to
//! them.
//!
//! Waiting helpers give up after [`WAIT_TIMEOUT`] and return `None`.

use crate::channel::{
    Channel, ChannelEventSender, HttpChannel, HttpChannelConfig, SacpChannel, SacpChannelConfig,
    SacpTransport, TextSerialChannel,
};
use crate::link::{Link, LinkEvent, LinkOpener};
use crate::manager::{ChannelFactory, TransportTarget};
use crate::sacp::buffer::PayloadWriter;
use crate::sacp::commands::{system, RESULT_OK};
use crate::sacp::dispatcher::{Dispatcher, DispatcherConfig};
use crate::sacp::packet::{CommandTag, FrameDecoder, Packet, PeerId};
use crate::sacp::telemetry::{CoordinateInfo, MachineInfo, ModuleList, NetworkInfo, Telemetry};
use crate::text::TextControllerConfig;
use async_trait::async_trait;
use fablink_core::{Axis, HeadType, MachineSeries, ModuleInfo, Position, Protocol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub use crate::link::{MockLinkOpener, MockPeer};

/// How long waiting helpers poll before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

async fn poll_until<T>(mut check: impl FnMut() -> Option<T>) -> Option<T> {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .ok()
}

/// Computes the ack payload for a request; `None` leaves it unanswered
pub type Responder = Arc<dyn Fn(&Packet) -> Option<Vec<u8>> + Send + Sync>;

/// What the simulated machine reports about itself
#[derive(Debug, Clone)]
pub struct MachineProfile {
    /// Reported series.
    pub series: MachineSeries,
    /// Controller firmware.
    pub firmware_version: String,
    /// Attached modules.
    pub modules: Vec<ModuleInfo>,
    /// Homed flag in coordinate info.
    pub is_homed: bool,
    /// Position in coordinate info.
    pub position: Position,
    /// Wi-Fi settings.
    pub network: NetworkInfo,
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            series: MachineSeries::A350,
            firmware_version: "v4.5.0".to_string(),
            modules: Vec::new(),
            is_homed: true,
            position: Position::default(),
            network: NetworkInfo::default(),
        }
    }
}

/// Module descriptor for tests
pub fn module(key: u8, module_id: u16, module_index: u8) -> ModuleInfo {
    ModuleInfo {
        key,
        module_id,
        module_index,
        module_state: 1,
        serial_number: 1000 + u32::from(key),
        hardware_version: 1,
        firmware_version: "1.0.0".to_string(),
    }
}

#[derive(Default)]
struct MachineShared {
    profile: Mutex<MachineProfile>,
    responders: Mutex<HashMap<CommandTag, Responder>>,
    received: Mutex<Vec<Packet>>,
    consumed: Mutex<HashMap<CommandTag, usize>>,
    awaiting: Mutex<HashMap<(CommandTag, u16), oneshot::Sender<Packet>>>,
    raw: Mutex<Vec<u8>>,
}

impl MachineShared {
    fn reply_for(&self, packet: &Packet) -> Option<Vec<u8>> {
        let responder = self.responders.lock().get(&packet.tag).cloned();
        if let Some(responder) = responder {
            return responder(packet);
        }
        let profile = self.profile.lock();
        let payload = match packet.tag {
            system::MACHINE_INFO => MachineInfo::new(
                profile.series.machine_id().unwrap_or(u8::MAX),
                profile.firmware_version.clone(),
            )
            .encode(),
            system::MODULE_INFO => ModuleList(profile.modules.clone()).encode(),
            system::COORDINATE_INFO => CoordinateInfo {
                is_homed: profile.is_homed,
                coordinates: vec![
                    (Axis::X, profile.position.x),
                    (Axis::Y, profile.position.y),
                    (Axis::Z, profile.position.z),
                    (Axis::B, profile.position.b),
                ],
            }
            .encode(),
            system::GET_NETWORK => profile.network.encode(),
            system::EXECUTE_GCODE => PayloadWriter::new().u8(RESULT_OK).string("ok").finish(),
            _ => vec![RESULT_OK],
        };
        Some(payload)
    }
}

/// Scripted binary-protocol peer
pub struct FakeMachine {
    shared: Arc<MachineShared>,
    inject: mpsc::Sender<LinkEvent>,
    sequence: AtomicU16,
    host: Option<Dispatcher>,
    task: JoinHandle<()>,
}

impl FakeMachine {
    /// Serve the far end of an existing mock link
    pub fn spawn(peer: MockPeer) -> Self {
        let shared = Arc::new(MachineShared::default());
        let inject = peer.injector();
        let task = tokio::spawn(serve_machine(peer, shared.clone(), inject.clone()));
        Self {
            shared,
            inject,
            sequence: AtomicU16::new(1),
            host: None,
            task,
        }
    }

    /// A fresh link for the host side and the machine behind it
    pub fn pair() -> (Link, Self) {
        let (link, peer) = MockPeer::pair("fake-machine");
        (link, Self::spawn(peer))
    }

    /// Queue a link on `opener` and serve it
    pub fn attach(opener: &MockLinkOpener) -> Self {
        Self::spawn(opener.queue_pair())
    }

    /// A machine with a host dispatcher already running against it
    pub fn start() -> Self {
        let (link, mut machine) = Self::pair();
        machine.host = Some(Dispatcher::start(link, DispatcherConfig::default()));
        machine
    }

    /// The host dispatcher created by [`FakeMachine::start`]
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.host.clone()
    }

    /// Report a different series
    pub fn with_series(self, series: MachineSeries) -> Self {
        self.shared.profile.lock().series = series;
        self
    }

    /// Report these modules
    pub fn with_modules(self, modules: Vec<ModuleInfo>) -> Self {
        self.shared.profile.lock().modules = modules;
        self
    }

    /// Report the homed flag
    pub fn with_homed(self, is_homed: bool) -> Self {
        self.shared.profile.lock().is_homed = is_homed;
        self
    }

    /// Edit the reported profile in place
    pub fn update_profile(&self, edit: impl FnOnce(&mut MachineProfile)) {
        edit(&mut self.shared.profile.lock());
    }

    /// Always answer `tag` with `payload`
    pub fn respond(&self, tag: CommandTag, payload: Vec<u8>) {
        self.respond_with(tag, move |_| Some(payload.clone()));
    }

    /// Answer `tag` with a computed payload
    pub fn respond_with<F>(&self, tag: CommandTag, responder: F)
    where
        F: Fn(&Packet) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.shared.responders.lock().insert(tag, Arc::new(responder));
    }

    /// Never answer `tag`
    pub fn silence(&self, tag: CommandTag) {
        self.respond_with(tag, |_| None);
    }

    /// Requests received for `tag` so far
    pub fn received(&self, tag: CommandTag) -> Vec<Packet> {
        self.shared
            .received
            .lock()
            .iter()
            .filter(|p| p.tag == tag)
            .cloned()
            .collect()
    }

    /// Number of requests received for `tag`
    pub fn count(&self, tag: CommandTag) -> usize {
        self.shared
            .received
            .lock()
            .iter()
            .filter(|p| p.tag == tag)
            .count()
    }

    /// Every tag received, in arrival order
    pub fn received_tags(&self) -> Vec<CommandTag> {
        self.shared.received.lock().iter().map(|p| p.tag).collect()
    }

    /// Next not yet consumed request for `tag`, waiting for it to arrive
    pub async fn wait_for(&self, tag: CommandTag) -> Option<Packet> {
        let shared = self.shared.clone();
        poll_until(move || {
            let received = shared.received.lock();
            let mut consumed = shared.consumed.lock();
            let cursor = consumed.entry(tag).or_insert(0);
            let packet = received.iter().filter(|p| p.tag == tag).nth(*cursor)?;
            *cursor += 1;
            Some(packet.clone())
        })
        .await
    }

    /// Non-frame bytes the host wrote, as text
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.shared.raw.lock()).into_owned()
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Push a telemetry sample as the machine would on a subscription
    pub async fn push<T: Telemetry>(&self, value: &T) -> bool {
        self.push_payload(T::TAG, value.encode()).await
    }

    /// Push a raw payload under `tag`
    pub async fn push_payload(&self, tag: CommandTag, payload: Vec<u8>) -> bool {
        let mut packet =
            Packet::request(tag, PeerId::Controller, PeerId::Host, self.next_sequence(), payload);
        packet.attribute = crate::sacp::packet::Attribute::Ack;
        self.push_packet(&packet).await
    }

    /// Write an arbitrary packet to the host
    pub async fn push_packet(&self, packet: &Packet) -> bool {
        match packet.encode() {
            Ok(frame) => self.push_bytes(frame).await,
            Err(_) => false,
        }
    }

    /// Write raw bytes to the host
    pub async fn push_bytes(&self, bytes: Vec<u8>) -> bool {
        self.inject.send(LinkEvent::Data(bytes)).await.is_ok()
    }

    /// Send a machine-initiated request and wait for the host's ack
    pub async fn request(&self, tag: CommandTag, payload: Vec<u8>) -> Option<Packet> {
        let sequence = self.next_sequence();
        let (tx, rx) = oneshot::channel();
        self.shared.awaiting.lock().insert((tag, sequence), tx);
        let packet = Packet::request(tag, PeerId::Controller, PeerId::Host, sequence, payload);
        if !self.push_packet(&packet).await {
            return None;
        }
        tokio::time::timeout(WAIT_TIMEOUT, rx).await.ok()?.ok()
    }

    /// Close the link from the machine side
    pub async fn close(&self, reason: Option<&str>) -> bool {
        self.inject
            .send(LinkEvent::Closed(reason.map(str::to_string)))
            .await
            .is_ok()
    }
}

impl Drop for FakeMachine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_machine(
    mut peer: MockPeer,
    shared: Arc<MachineShared>,
    inject: mpsc::Sender<LinkEvent>,
) {
    let mut decoder = FrameDecoder::new();
    while let Some(bytes) = peer.recv_written().await {
        if !bytes.starts_with(&crate::sacp::packet::MAGIC) {
            shared.raw.lock().extend_from_slice(&bytes);
        }
        decoder.push(&bytes);
        while let Some(frame) = decoder.next_frame() {
            let Ok(packet) = frame else { continue };
            if packet.is_ack() {
                let waiter = shared
                    .awaiting
                    .lock()
                    .remove(&(packet.tag, packet.sequence));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(packet);
                }
                continue;
            }
            shared.received.lock().push(packet.clone());
            if let Some(payload) = shared.reply_for(&packet) {
                if let Ok(frame) = packet.ack_for(payload).encode() {
                    if inject.send(LinkEvent::Data(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// What the simulated text firmware reports
#[derive(Debug, Clone)]
pub struct MarlinProfile {
    /// Size letter answered to `M1006`.
    pub series: MachineSeries,
    /// Tool head answered to `M1006`.
    pub head: HeadType,
    /// Firmware answered to `M1005`.
    pub firmware_version: String,
    /// Position answered to `M114`.
    pub position: Position,
    /// Nozzle current and target answered to `M105`.
    pub nozzle: (f64, f64),
    /// Bed current and target answered to `M105`.
    pub bed: (f64, f64),
    /// Ignore everything.
    pub muted: bool,
}

impl Default for MarlinProfile {
    fn default() -> Self {
        Self {
            series: MachineSeries::A250,
            head: HeadType::Printing,
            firmware_version: "Snapmaker_V2.2.0".to_string(),
            position: Position::default(),
            nozzle: (25.0, 0.0),
            bed: (24.0, 0.0),
            muted: false,
        }
    }
}

fn size_letter(series: MachineSeries) -> &'static str {
    match series {
        MachineSeries::A150 => "S",
        MachineSeries::A250 => "M",
        MachineSeries::A350 => "L",
        MachineSeries::Artisan => "A400",
        MachineSeries::J1 => "J1",
        MachineSeries::Ray => "RAY",
        _ => "ORIGINAL",
    }
}

fn head_name(head: HeadType) -> &'static str {
    match head {
        HeadType::Printing => "3DP",
        HeadType::Laser => "LASER",
        HeadType::Cnc => "CNC",
        HeadType::Unknown => "UNKNOWN",
    }
}

impl MarlinProfile {
    fn answer(&self, line: &str) -> Vec<String> {
        let code = line.split_whitespace().next().unwrap_or_default();
        let mut out = Vec::new();
        match code {
            "M114" => {
                let p = self.position;
                out.push(format!(
                    "X:{:.2} Y:{:.2} Z:{:.2} E:0.00 Count X:0 Y:0 Z:0",
                    p.x, p.y, p.z
                ));
                out.push("ok".to_string());
            }
            "M105" => out.push(format!(
                "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
                self.nozzle.0, self.nozzle.1, self.bed.0, self.bed.1
            )),
            "M1005" => {
                out.push(format!("Firmware Version: {}", self.firmware_version));
                out.push("ok".to_string());
            }
            "M1006" => {
                out.push(format!("Machine Size: {}", size_letter(self.series)));
                out.push(format!("Tool Head: {}", head_name(self.head)));
                out.push("ok".to_string());
            }
            "" => {}
            _ => out.push("ok".to_string()),
        }
        out
    }
}

#[derive(Default)]
struct MarlinShared {
    profile: Mutex<MarlinProfile>,
    lines: Mutex<Vec<String>>,
}

/// Scripted line-protocol firmware
pub struct FakeMarlin {
    shared: Arc<MarlinShared>,
    inject: mpsc::Sender<LinkEvent>,
    task: JoinHandle<()>,
}

impl FakeMarlin {
    /// Serve the far end of an existing mock link
    pub fn spawn(peer: MockPeer) -> Self {
        let shared = Arc::new(MarlinShared::default());
        let inject = peer.injector();
        let task = tokio::spawn(serve_marlin(peer, shared.clone(), inject.clone()));
        Self {
            shared,
            inject,
            task,
        }
    }

    /// A fresh link for the host side and the firmware behind it
    pub fn pair() -> (Link, Self) {
        let (link, peer) = MockPeer::pair("fake-marlin");
        (link, Self::spawn(peer))
    }

    /// Queue a link on `opener` and serve it
    pub fn attach(opener: &MockLinkOpener) -> Self {
        Self::spawn(opener.queue_pair())
    }

    /// Report a different series
    pub fn with_series(self, series: MachineSeries) -> Self {
        self.shared.profile.lock().series = series;
        self
    }

    /// Report a different tool head
    pub fn with_head(self, head: HeadType) -> Self {
        self.shared.profile.lock().head = head;
        self
    }

    /// Stop answering anything
    pub fn muted(self) -> Self {
        self.shared.profile.lock().muted = true;
        self
    }

    /// Edit the reported profile in place
    pub fn update_profile(&self, edit: impl FnOnce(&mut MarlinProfile)) {
        edit(&mut self.shared.profile.lock());
    }

    /// Lines the host wrote so far
    pub fn lines(&self) -> Vec<String> {
        self.shared.lines.lock().clone()
    }

    /// Wait until the host has written a line starting with `prefix`
    pub async fn wait_for_line(&self, prefix: &str) -> Option<String> {
        let shared = self.shared.clone();
        let prefix = prefix.to_string();
        poll_until(move || {
            shared
                .lines
                .lock()
                .iter()
                .find(|l| l.starts_with(&prefix))
                .cloned()
        })
        .await
    }

    /// Send an unsolicited line to the host
    pub async fn send_line(&self, line: &str) -> bool {
        let data = format!("{}\n", line).into_bytes();
        self.inject.send(LinkEvent::Data(data)).await.is_ok()
    }

    /// Close the link from the firmware side
    pub async fn close(&self) -> bool {
        self.inject.send(LinkEvent::Closed(None)).await.is_ok()
    }
}

impl Drop for FakeMarlin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_marlin(
    mut peer: MockPeer,
    shared: Arc<MarlinShared>,
    inject: mpsc::Sender<LinkEvent>,
) {
    let mut buffer = String::new();
    while let Some(bytes) = peer.recv_written().await {
        buffer.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim().to_string();
            buffer.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            shared.lines.lock().push(line.clone());
            let answer = {
                let profile = shared.profile.lock();
                if profile.muted {
                    continue;
                }
                profile.answer(&line)
            };
            for reply in answer {
                let data = format!("{}\n", reply).into_bytes();
                if inject.send(LinkEvent::Data(data)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Channel factory over one mock opener
///
/// Detection answers the scripted protocol; every channel opens the next
/// link queued on [`ScriptedFactory::opener`], so attach a fake before each
/// `connection_open`.
pub struct ScriptedFactory {
    opener: Arc<MockLinkOpener>,
    detected: Mutex<Protocol>,
    detections: AtomicUsize,
    sacp: SacpChannelConfig,
    text: TextControllerConfig,
    http_port: u16,
}

impl ScriptedFactory {
    /// Detect `detected` for every target
    pub fn new(detected: Protocol) -> Self {
        Self {
            opener: Arc::new(MockLinkOpener::new("scripted")),
            detected: Mutex::new(detected),
            detections: AtomicUsize::new(0),
            sacp: SacpChannelConfig::default(),
            text: TextControllerConfig::default(),
            http_port: crate::channel::http::DEFAULT_HTTP_PORT,
        }
    }

    /// Session settings for binary-protocol channels
    pub fn with_sacp_config(mut self, config: SacpChannelConfig) -> Self {
        self.sacp = config;
        self
    }

    /// Controller settings for text channels
    pub fn with_text_config(mut self, config: TextControllerConfig) -> Self {
        self.text = config;
        self
    }

    /// Port HTTP channels connect to
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Opener every link-based channel uses
    pub fn opener(&self) -> &Arc<MockLinkOpener> {
        &self.opener
    }

    /// Change what detection answers
    pub fn set_detected(&self, protocol: Protocol) {
        *self.detected.lock() = protocol;
    }

    /// How often detection ran
    pub fn detections(&self) -> usize {
        self.detections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelFactory for ScriptedFactory {
    async fn detect(&self, _target: &TransportTarget) -> fablink_core::Result<Protocol> {
        self.detections.fetch_add(1, Ordering::SeqCst);
        Ok(*self.detected.lock())
    }

    fn create(
        &self,
        protocol: Protocol,
        target: &TransportTarget,
        events: ChannelEventSender,
    ) -> fablink_core::Result<Channel> {
        let opener: Arc<dyn LinkOpener> = self.opener.clone();
        let sacp = |transport: SacpTransport| {
            Channel::sacp(SacpChannel::new(
                transport,
                opener.clone(),
                self.sacp.clone(),
                events.clone(),
            ))
        };
        let channel = match protocol {
            Protocol::PlainText => Channel::TextSerial(Arc::new(TextSerialChannel::new(
                opener.clone(),
                self.text,
                events.clone(),
            ))),
            Protocol::SacpOverSerial => sacp(SacpTransport::Serial),
            Protocol::SacpOverTcp => sacp(SacpTransport::Tcp),
            Protocol::SacpOverUdp => sacp(SacpTransport::Udp),
            Protocol::Http => {
                let host = match target {
                    TransportTarget::Network { host } => host.clone(),
                    TransportTarget::Serial { path, .. } => path.clone(),
                };
                let mut config = HttpChannelConfig::new(host);
                config.port = self.http_port;
                Channel::Http(Arc::new(HttpChannel::new(config, events.clone())?))
            }
            Protocol::Unknown => {
                return Err(fablink_core::DetectionError::UnknownMachine {
                    target: target.to_string(),
                }
                .into())
            }
        };
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sacp::telemetry::Heartbeat;

    #[tokio::test]
    async fn test_fake_machine_answers_and_records() {
        let machine = FakeMachine::start().with_series(MachineSeries::Ray);
        let body = machine
            .dispatcher()
            .unwrap()
            .request(system::MACHINE_INFO, Vec::new())
            .await
            .unwrap();
        let info = MachineInfo::decode(&body).unwrap();
        assert_eq!(info.series, MachineSeries::Ray);
        assert_eq!(machine.count(system::MACHINE_INFO), 1);
        assert!(machine.wait_for(system::MACHINE_INFO).await.is_some());
    }

    #[tokio::test]
    async fn test_silenced_tag_times_out() {
        let machine = FakeMachine::start();
        machine.silence(system::HOME);
        let result = machine
            .dispatcher()
            .unwrap()
            .send_with_timeout(
                system::HOME,
                PeerId::Controller,
                Vec::new(),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_machine_request_gets_host_ack() {
        let machine = FakeMachine::start();
        let dispatcher = machine.dispatcher().unwrap();
        dispatcher.set_handler(system::HEARTBEAT, |d, packet| {
            let _ = d.ack(&packet, Heartbeat { code: 0 }.encode());
        });
        let ack = machine.request(system::HEARTBEAT, Vec::new()).await.unwrap();
        assert_eq!(ack.result_code(), Some(RESULT_OK));
    }

    #[tokio::test]
    async fn test_fake_marlin_answers_queries() {
        let (mut link, marlin) = FakeMarlin::pair();
        link.writer.write_all(b"M1006\n").await.unwrap();
        let mut text = String::new();
        while !text.contains("ok") {
            if let Some(LinkEvent::Data(bytes)) = link.events.recv().await {
                text.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        assert!(text.contains("Machine Size: M"));
        assert_eq!(marlin.lines(), vec!["M1006".to_string()]);
    }
}
