//! Marlin line controller
//!
//! One command is in flight at a time and the next one is written only after
//! the firmware answers `ok` (or an error). While idle the controller
//! re-queries position and temperature, at most one query outstanding.
//! After open it identifies the firmware with `M1005`/`M1006` and emits
//! `Ready` once those answer, or once the firmware stayed silent for the
//! ready timeout.

use super::parser::{MarlinParser, MarlinResponse, TemperatureReport};
use crate::link::{Link, LinkEvent, LinkWriter};
use fablink_core::{ChannelError, ConnectionError, HeadType, MachineSeries, Position, ProtocolError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 256;
const COMMAND_QUEUE: usize = 100;

/// Controller timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextControllerConfig {
    /// Idle re-query period for position and temperature.
    pub query_interval: Duration,
    /// Silence after which `Ready` is emitted without identification.
    pub ready_timeout: Duration,
    /// Longest a command may wait for its `ok`.
    pub command_timeout: Duration,
}

impl Default for TextControllerConfig {
    fn default() -> Self {
        Self {
            query_interval: Duration::from_millis(1000),
            ready_timeout: Duration::from_millis(3000),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// What the firmware said about itself
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FirmwareInfo {
    /// Version string from `M1005`.
    pub version: Option<String>,
    /// Series from the size letter of `M1006`.
    pub series: MachineSeries,
    /// Tool head from `M1006`.
    pub head: HeadType,
}

/// Controller events
#[derive(Debug, Clone, PartialEq)]
pub enum TextEvent {
    /// A command was acknowledged.
    Ok,
    /// The firmware reported an error.
    Error(String),
    /// New position.
    Pos(Position),
    /// New temperatures.
    Temperature(TemperatureReport),
    /// Identification changed.
    Firmware(FirmwareInfo),
    /// The controller accepts commands.
    Ready(FirmwareInfo),
    /// Any other line.
    Line(String),
    /// The link went away.
    Closed(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Identify,
    Query,
}

struct Outgoing {
    line: String,
    origin: Origin,
    reply: Option<oneshot::Sender<Result<Vec<String>>>>,
}

struct InFlight {
    outgoing: Outgoing,
    collected: Vec<String>,
    sent_at: Instant,
}

struct Shared {
    events: broadcast::Sender<TextEvent>,
    open: AtomicBool,
    firmware: RwLock<FirmwareInfo>,
    position: RwLock<Position>,
    temperature: RwLock<TemperatureReport>,
}

/// Line-protocol controller bound to one link at a time
pub struct TextController {
    config: TextControllerConfig,
    shared: Arc<Shared>,
    command_tx: Mutex<Option<mpsc::Sender<Outgoing>>>,
    writer: Mutex<Option<Arc<dyn LinkWriter>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl TextController {
    /// Create a closed controller
    pub fn new(config: TextControllerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            shared: Arc::new(Shared {
                events,
                open: AtomicBool::new(false),
                firmware: RwLock::new(FirmwareInfo::default()),
                position: RwLock::new(Position::default()),
                temperature: RwLock::new(TemperatureReport::default()),
            }),
            command_tx: Mutex::new(None),
            writer: Mutex::new(None),
            io_task: Mutex::new(None),
        }
    }

    /// Receive controller events
    pub fn subscribe(&self) -> broadcast::Receiver<TextEvent> {
        self.shared.events.subscribe()
    }

    /// Whether a link is attached and alive
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Identification gathered so far
    pub fn firmware(&self) -> FirmwareInfo {
        self.shared.firmware.read().clone()
    }

    /// Last reported position
    pub fn position(&self) -> Position {
        *self.shared.position.read()
    }

    /// Last reported temperatures
    pub fn temperature(&self) -> TemperatureReport {
        *self.shared.temperature.read()
    }

    /// Attach a link and start the IO loop
    pub async fn open(&self, link: Link) -> Result<()> {
        self.close().await;

        let Link {
            writer,
            events,
            peer,
        } = link;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        *self.shared.firmware.write() = FirmwareInfo::default();
        self.shared.open.store(true, Ordering::SeqCst);

        let io = IoLoop {
            config: self.config,
            shared: self.shared.clone(),
            writer: writer.clone(),
            peer: peer.clone(),
            parser: MarlinParser::new(),
            queue: VecDeque::new(),
            in_flight: None,
            ready: false,
            next_query: 0,
            buffer: String::new(),
        };
        let handle = tokio::spawn(io.run(events, command_rx));

        *self.command_tx.lock() = Some(command_tx);
        *self.writer.lock() = Some(writer);
        *self.io_task.lock() = Some(handle);
        tracing::info!("Text controller opened on {}", peer);
        Ok(())
    }

    /// Detach the link; pending commands fail with connection closed
    pub async fn close(&self) {
        let was_open = self.shared.open.swap(false, Ordering::SeqCst);
        self.command_tx.lock().take();
        let handle = self.io_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Text link shutdown failed: {}", e);
            }
        }
        if was_open {
            tracing::info!("Text controller closed");
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Outgoing>> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen.into());
        }
        self.command_tx
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::NotOpen.into())
    }

    /// Send one line and wait for its `ok`; returns the lines answered before it
    pub async fn command(&self, line: &str) -> Result<Vec<String>> {
        let sender = self.sender()?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Outgoing {
                line: line.trim().to_string(),
                origin: Origin::User,
                reply: Some(tx),
            })
            .await
            .map_err(|_| ConnectionError::closed("text controller stopped"))?;
        rx.await
            .map_err(|_| ConnectionError::closed("text controller stopped"))?
    }

    /// Queue one line without waiting for its acknowledgement
    pub async fn writeln(&self, line: &str) -> Result<()> {
        let sender = self.sender()?;
        sender
            .send(Outgoing {
                line: line.trim().to_string(),
                origin: Origin::User,
                reply: None,
            })
            .await
            .map_err(|_| ConnectionError::closed("text controller stopped").into())
    }

    /// Run every non-empty line of `gcode` in order; returns all output
    pub async fn execute(&self, gcode: &str) -> Result<Vec<String>> {
        let mut output = Vec::new();
        for line in gcode.lines().map(str::trim).filter(|l| !l.is_empty()) {
            output.extend(self.command(line).await?);
        }
        Ok(output)
    }
}

impl Drop for TextController {
    fn drop(&mut self) {
        if let Some(handle) = self.io_task.lock().take() {
            handle.abort();
        }
    }
}

struct IoLoop {
    config: TextControllerConfig,
    shared: Arc<Shared>,
    writer: Arc<dyn LinkWriter>,
    peer: String,
    parser: MarlinParser,
    queue: VecDeque<Outgoing>,
    in_flight: Option<InFlight>,
    ready: bool,
    next_query: usize,
    buffer: String,
}

const QUERIES: [&str; 2] = ["M114", "M105"];
const IDENTIFY: [&str; 2] = ["M1005", "M1006"];

impl IoLoop {
    fn emit(&self, event: TextEvent) {
        let _ = self.shared.events.send(event);
    }

    async fn run(mut self, mut events: mpsc::Receiver<LinkEvent>, mut commands: mpsc::Receiver<Outgoing>) {
        for line in IDENTIFY {
            self.queue.push_back(Outgoing {
                line: line.to_string(),
                origin: Origin::Identify,
                reply: None,
            });
        }
        self.pump().await;

        let ready_deadline = tokio::time::sleep(self.config.ready_timeout);
        tokio::pin!(ready_deadline);
        let mut ticker = tokio::time::interval(self.config.query_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let reason = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(LinkEvent::Data(bytes)) => {
                        ready_deadline.as_mut().reset(Instant::now() + self.config.ready_timeout);
                        self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = self.buffer.find('\n') {
                            let line: String = self.buffer.drain(..=pos).collect();
                            self.handle_line(line.trim());
                        }
                        self.pump().await;
                    }
                    Some(LinkEvent::Closed(reason)) => break reason,
                    None => break Some("link reader stopped".to_string()),
                },
                outgoing = commands.recv() => match outgoing {
                    Some(outgoing) => {
                        self.queue.push_back(outgoing);
                        self.pump().await;
                    }
                    None => break None,
                },
                _ = &mut ready_deadline, if !self.ready => {
                    tracing::debug!("{} silent, ready without identification", self.peer);
                    self.abandon_identification();
                    self.become_ready();
                    self.pump().await;
                }
                _ = ticker.tick() => {
                    self.expire_in_flight();
                    self.schedule_query();
                    self.pump().await;
                }
            }
            if !self.shared.open.load(Ordering::SeqCst) {
                break None;
            }
        };

        self.shared.open.store(false, Ordering::SeqCst);
        let failure = reason.clone().unwrap_or_else(|| "closed".to_string());
        if let Some(in_flight) = self.in_flight.take() {
            fail(in_flight.outgoing, &failure);
        }
        for outgoing in self.queue.drain(..) {
            fail(outgoing, &failure);
        }
        tracing::warn!("Text link {} closed: {}", self.peer, failure);
        self.emit(TextEvent::Closed(reason));
    }

    async fn pump(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(outgoing) = self.queue.pop_front() else {
            return;
        };
        tracing::trace!("-> {}", outgoing.line);
        let data = format!("{}\n", outgoing.line);
        match self.writer.write_all(data.as_bytes()).await {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    outgoing,
                    collected: Vec::new(),
                    sent_at: Instant::now(),
                });
            }
            Err(e) => {
                tracing::error!("Write to {} failed: {}", self.peer, e);
                fail(outgoing, &e.to_string());
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        tracing::trace!("<- {}", line);
        for response in self.parser.parse(line) {
            match response {
                MarlinResponse::Ok => self.complete(Ok(())),
                MarlinResponse::Error(msg) => {
                    tracing::warn!("Firmware error: {}", msg);
                    self.emit(TextEvent::Error(msg.clone()));
                    self.complete(Err(msg));
                }
                MarlinResponse::Position(position) => {
                    *self.shared.position.write() = position;
                    self.collect(line);
                    self.emit(TextEvent::Pos(position));
                }
                MarlinResponse::Temperature(report) => {
                    *self.shared.temperature.write() = report;
                    self.collect(line);
                    self.emit(TextEvent::Temperature(report));
                }
                MarlinResponse::Firmware(version) => {
                    self.update_firmware(|f| f.version = Some(version));
                }
                MarlinResponse::MachineSize(series) => {
                    self.update_firmware(|f| f.series = series);
                }
                MarlinResponse::ToolHead(head) => {
                    self.update_firmware(|f| f.head = head);
                }
                MarlinResponse::Echo(_) | MarlinResponse::Start | MarlinResponse::Message(_) => {
                    self.collect(line);
                    self.emit(TextEvent::Line(line.to_string()));
                }
            }
        }
    }

    fn update_firmware(&mut self, edit: impl FnOnce(&mut FirmwareInfo)) {
        let info = {
            let mut firmware = self.shared.firmware.write();
            edit(&mut firmware);
            firmware.clone()
        };
        self.emit(TextEvent::Firmware(info));
    }

    fn collect(&mut self, line: &str) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.collected.push(line.to_string());
        }
    }

    fn complete(&mut self, outcome: std::result::Result<(), String>) {
        let Some(in_flight) = self.in_flight.take() else {
            tracing::debug!("Unmatched acknowledgement from {}", self.peer);
            return;
        };
        let InFlight {
            outgoing,
            collected,
            ..
        } = in_flight;
        let origin = outgoing.origin;
        let identified = origin == Origin::Identify && outgoing.line == IDENTIFY[IDENTIFY.len() - 1];

        if let Some(reply) = outgoing.reply {
            let result = match outcome {
                Ok(()) => Ok(collected),
                Err(reason) => Err(ChannelError::CommandRejected { reason }.into()),
            };
            let _ = reply.send(result);
        }
        if origin == Origin::User {
            self.emit(TextEvent::Ok);
        }
        if identified && !self.ready {
            self.become_ready();
        }
    }

    fn become_ready(&mut self) {
        self.ready = true;
        let info = self.shared.firmware.read().clone();
        tracing::info!(
            "{} ready: {} {} {}",
            self.peer,
            info.series,
            info.head,
            info.version.as_deref().unwrap_or("unknown firmware")
        );
        self.emit(TextEvent::Ready(info));
    }

    fn abandon_identification(&mut self) {
        self.queue.retain(|o| o.origin != Origin::Identify);
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.outgoing.origin == Origin::Identify)
        {
            self.in_flight = None;
        }
    }

    fn expire_in_flight(&mut self) {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.sent_at.elapsed() >= self.config.command_timeout);
        if !expired {
            return;
        }
        if let Some(in_flight) = self.in_flight.take() {
            tracing::warn!("No answer to '{}' from {}", in_flight.outgoing.line, self.peer);
            if let Some(reply) = in_flight.outgoing.reply {
                let _ = reply.send(Err(ProtocolError::RequestTimeout {
                    command_set: 0,
                    command_id: 0,
                    timeout_ms: self.config.command_timeout.as_millis() as u64,
                }
                .into()));
            }
        }
    }

    fn schedule_query(&mut self) {
        if !self.ready || self.in_flight.is_some() || !self.queue.is_empty() {
            return;
        }
        let line = QUERIES[self.next_query % QUERIES.len()];
        self.next_query = self.next_query.wrapping_add(1);
        self.queue.push_back(Outgoing {
            line: line.to_string(),
            origin: Origin::Query,
            reply: None,
        });
    }
}

fn fail(outgoing: Outgoing, reason: &str) {
    if let Some(reply) = outgoing.reply {
        let _ = reply.send(Err(ConnectionError::closed(reason.to_string()).into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPeer;
    use crate::testing::FakeMarlin;

    fn fast() -> TextControllerConfig {
        TextControllerConfig {
            query_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(500),
        }
    }

    async fn next_ready(rx: &mut broadcast::Receiver<TextEvent>) -> FirmwareInfo {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(TextEvent::Ready(info)) = rx.recv().await {
                    return info;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_ready_after_identification() {
        let (link, marlin) = FakeMarlin::pair();
        let marlin = marlin
            .with_series(MachineSeries::A350)
            .with_head(HeadType::Laser);
        let controller = TextController::new(fast());
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();

        let info = next_ready(&mut events).await;
        assert_eq!(info.series, MachineSeries::A350);
        assert_eq!(info.head, HeadType::Laser);
        assert_eq!(info.version.as_deref(), Some("Snapmaker_V2.2.0"));
        assert_eq!(&marlin.lines()[..2], &["M1005".to_string(), "M1006".to_string()]);
    }

    #[tokio::test]
    async fn test_ready_after_silence() {
        let (link, peer) = MockPeer::pair("silent");
        let controller = TextController::new(fast());
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();
        let info = next_ready(&mut events).await;
        assert_eq!(info, FirmwareInfo::default());
        drop(peer);
    }

    #[tokio::test]
    async fn test_command_collects_output() {
        let (link, marlin) = FakeMarlin::pair();
        marlin.update_profile(|p| p.position = Position::new(1.0, 2.0, 3.0));
        let controller = TextController::new(fast());
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();
        next_ready(&mut events).await;

        let output = controller.command("M114").await.unwrap();
        assert!(output[0].starts_with("X:1.00 Y:2.00 Z:3.00"));
        assert_eq!(controller.position(), Position::new(1.0, 2.0, 3.0));
    }

    #[tokio::test]
    async fn test_one_command_in_flight() {
        let (link, mut peer) = MockPeer::pair("manual");
        let controller = Arc::new(TextController::new(TextControllerConfig {
            ready_timeout: Duration::from_millis(20),
            query_interval: Duration::from_secs(60),
            ..fast()
        }));
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();
        next_ready(&mut events).await;
        peer.drain_written();

        let first = {
            let c = controller.clone();
            tokio::spawn(async move { c.command("G28").await })
        };
        let second = {
            let c = controller.clone();
            tokio::spawn(async move { c.command("G0 X10").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = String::from_utf8(peer.drain_written()).unwrap();
        assert_eq!(written.lines().count(), 1);

        peer.push(b"ok\n".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = String::from_utf8(peer.drain_written()).unwrap();
        assert_eq!(written.lines().count(), 1);
        peer.push(b"ok\n".to_vec()).await;

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_error_rejects_command() {
        let (link, peer) = MockPeer::pair("manual");
        let controller = Arc::new(TextController::new(TextControllerConfig {
            ready_timeout: Duration::from_millis(20),
            query_interval: Duration::from_secs(60),
            ..fast()
        }));
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();
        next_ready(&mut events).await;

        let pending = {
            let c = controller.clone();
            tokio::spawn(async move { c.command("G1 X9999").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        peer.push(b"Error:Out of bounds\n".to_vec()).await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Out of bounds"));
    }

    #[tokio::test]
    async fn test_idle_queries_temperatures() {
        let (link, marlin) = FakeMarlin::pair();
        let controller = TextController::new(fast());
        controller.open(link).await.unwrap();
        assert!(marlin.wait_for_line("M105").await.is_some());
        assert!(marlin.wait_for_line("M114").await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.temperature().nozzle, Some((25.0, 0.0)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_emits() {
        let (link, marlin) = FakeMarlin::pair();
        let marlin = marlin.muted();
        let controller = Arc::new(TextController::new(fast()));
        let mut events = controller.subscribe();
        controller.open(link).await.unwrap();
        next_ready(&mut events).await;

        let pending = {
            let c = controller.clone();
            tokio::spawn(async move { c.command("G28").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        marlin.close().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!controller.is_open());
        assert!(controller.command("G28").await.is_err());
    }
}
