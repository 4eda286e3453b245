//! Connection manager
//!
//! Owns at most one channel and the machine instance bound to it, and turns
//! their activity into the normalized events on the [`EventBus`].
//!
//! `Closed → Detecting → Opening → Ready → Closed`
//!
//! Opening a new connection tears the previous one down first. A session
//! that dies on its own (transport loss, heartbeat timeout) is torn down by
//! a monitor task before `connection:close` is published, so a following
//! `connection_open` always starts clean.

pub mod commands;
pub mod factory;
pub mod gcode;

use crate::channel::{Channel, ChannelEvent, PrintRequest, ReadyInfo};
use crate::machine::{LegacyInstance, MachineInstance, SacpInstance};
use crate::sacp::telemetry::NetworkInfo;
use crate::sacp::transfer::TransferProgress;
use fablink_core::{
    AppEvent, ChannelError, ConnectionError, ConnectionEvent, DetectionError, DisconnectReason,
    EventBus, MachineEvent, MachineState, PrintEvent, PrintProgress, Protocol, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use commands::MachineCommand;
pub use factory::{
    ChannelFactory, DefaultChannelFactory, HttpSettings, ManagerConfig, TransportTarget,
};

struct Session {
    id: Uuid,
    target: String,
    channel: Channel,
    instance: Arc<dyn MachineInstance>,
    monitor: Option<JoinHandle<()>>,
}

struct ManagerInner {
    factory: Arc<dyn ChannelFactory>,
    bus: Arc<EventBus>,
    ready_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl ManagerInner {
    fn publish(&self, event: ConnectionEvent) {
        self.bus.publish(AppEvent::Connection(event));
    }

    /// Unwind a session that is no longer reachable through `session`
    async fn teardown(&self, mut session: Session, reason: DisconnectReason, graceful: bool) {
        if let Some(monitor) = session.monitor.take() {
            monitor.abort();
        }
        session.instance.on_closing().await;
        let lifecycle = session.channel.lifecycle();
        if graceful {
            if let Err(e) = lifecycle.connection_close().await {
                tracing::warn!("Graceful close of {} failed: {}", session.target, e);
                lifecycle.connection_close_improper().await;
            }
        } else {
            lifecycle.connection_close_improper().await;
        }
        tracing::info!("Closed {}: {}", session.target, reason);
        self.publish(ConnectionEvent::Close {
            target: session.target,
            reason,
        });
    }
}

/// Machine instance for the kind of channel that became ready
fn instance_for(
    channel: &Channel,
    ready: ReadyInfo,
    bus: Arc<EventBus>,
) -> Arc<dyn MachineInstance> {
    match (channel.as_sacp(), channel.legacy_telemetry()) {
        (Some(sacp), _) => Arc::new(SacpInstance::new(sacp.clone(), ready.series, bus)),
        (None, Some(telemetry)) => Arc::new(LegacyInstance::new(telemetry, ready, bus)),
        (None, None) => Arc::new(LegacyInstance::new(Default::default(), ready, bus)),
    }
}

/// Single-machine connection façade
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager over real transports
    pub fn new(config: ManagerConfig, bus: Arc<EventBus>) -> Self {
        let ready_timeout = config.ready_timeout;
        Self::with_factory(Arc::new(DefaultChannelFactory::new(config)), bus, ready_timeout)
    }

    /// Manager building its channels through `factory`
    pub fn with_factory(
        factory: Arc<dyn ChannelFactory>,
        bus: Arc<EventBus>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                bus,
                ready_timeout,
                session: Mutex::new(None),
            }),
        }
    }

    /// Bus the normalized events go to
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Whether a session is open
    pub async fn is_open(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    /// Protocol of the open session
    pub async fn protocol(&self) -> Option<Protocol> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.channel.protocol())
    }

    /// Latest machine state of the open session
    pub async fn state(&self) -> Option<MachineState> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.instance.state())
    }

    /// Id of the open session
    pub async fn session_id(&self) -> Option<Uuid> {
        self.inner.session.lock().await.as_ref().map(|s| s.id)
    }

    /// Progress of the running print job
    pub async fn print_progress(&self) -> Option<PrintProgress> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.instance.tracker().progress())
    }

    /// Connect to the machine at `target`
    ///
    /// Any open session is torn down first. A recognized `hint` skips
    /// detection; detection that identifies nothing fails with
    /// [`DetectionError::UnknownMachine`]. Returns the connected state.
    pub async fn connection_open(
        &self,
        target: TransportTarget,
        hint: Option<Protocol>,
    ) -> Result<MachineState> {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;
        if let Some(previous) = slot.take() {
            inner
                .teardown(previous, DisconnectReason::Superseded, true)
                .await;
        }

        let label = target.to_string();
        inner.publish(ConnectionEvent::Connecting {
            target: label.clone(),
        });

        let protocol = match hint.filter(|p| *p != Protocol::Unknown) {
            Some(protocol) if target.carries(protocol) => protocol,
            Some(protocol) => {
                return Err(ChannelError::InvalidArgument {
                    reason: format!("{} cannot run over {}", protocol, label),
                }
                .into())
            }
            None => inner.factory.detect(&target).await?,
        };
        if protocol == Protocol::Unknown {
            tracing::warn!("Could not identify machine at {}", label);
            return Err(DetectionError::UnknownMachine { target: label }.into());
        }

        let (tx, mut events) = mpsc::unbounded_channel();
        let channel = inner.factory.create(protocol, &target, tx)?;
        if let Err(e) = channel.lifecycle().connection_open().await {
            tracing::error!("Could not open {} over {}: {}", label, protocol, e);
            return Err(e);
        }

        let ready = match self.await_ready(&label, protocol, &mut events).await {
            Ok(ready) => ready,
            Err(e) => {
                channel.lifecycle().connection_close_improper().await;
                inner.publish(ConnectionEvent::Close {
                    target: label,
                    reason: DisconnectReason::ConnectionLost(e.to_string()),
                });
                return Err(e);
            }
        };

        let instance = instance_for(&channel, ready, inner.bus.clone());
        let id = Uuid::new_v4();
        let mut session = Session {
            id,
            target: label.clone(),
            channel,
            instance,
            monitor: None,
        };
        let state = match session.instance.on_prepare().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Preparing {} failed: {}", label, e);
                inner
                    .teardown(
                        session,
                        DisconnectReason::ConnectionLost(e.to_string()),
                        false,
                    )
                    .await;
                return Err(e);
            }
        };

        let err = session.instance.connect_warning(&state);
        session.monitor = Some(self.spawn_monitor(id, events));
        *slot = Some(session);
        drop(slot);

        tracing::info!(
            "Connected to {} {} over {} (session {})",
            state.series,
            label,
            protocol,
            id
        );
        inner.publish(ConnectionEvent::Connected {
            state: Box::new(state.clone()),
            err,
        });
        Ok(state)
    }

    async fn await_ready(
        &self,
        label: &str,
        protocol: Protocol,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<ReadyInfo> {
        let deadline = tokio::time::Instant::now() + self.inner.ready_timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| ConnectionError::ConnectionTimeout {
                    timeout_ms: self.inner.ready_timeout.as_millis() as u64,
                })?;
            match event {
                Some(ChannelEvent::Connected) => self.inner.publish(ConnectionEvent::Open {
                    target: label.to_string(),
                    protocol,
                }),
                Some(ChannelEvent::Ready(info)) => return Ok(info),
                Some(ChannelEvent::Closed(reason)) => {
                    return Err(ConnectionError::closed(reason.to_string()).into())
                }
                None => return Err(ConnectionError::closed("channel dropped").into()),
            }
        }
    }

    /// Tear the session down once its channel reports `Closed`
    fn spawn_monitor(
        &self,
        id: Uuid,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Some(ChannelEvent::Closed(reason)) => break reason,
                    Some(other) => tracing::debug!("Ignoring {:?} on a ready session", other),
                    None => break DisconnectReason::ConnectionLost("channel dropped".to_string()),
                }
            };
            let session = {
                let mut slot = inner.session.lock().await;
                match slot.as_ref() {
                    Some(s) if s.id == id => slot.take(),
                    _ => None,
                }
            };
            if let Some(mut session) = session {
                tracing::error!("Connection to {} lost: {}", session.target, reason);
                // Dropping our own handle; aborting it would cancel this task.
                session.monitor.take();
                inner.teardown(session, reason, false).await;
            }
        })
    }

    /// Close the session; `force` skips the protocol goodbye
    ///
    /// Returns false when nothing was open.
    pub async fn connection_close(&self, force: bool) -> Result<bool> {
        let taken = self.inner.session.lock().await.take();
        let Some(session) = taken else {
            tracing::debug!("Close requested with no open connection");
            return Ok(false);
        };
        self.inner
            .teardown(session, DisconnectReason::UserRequested, !force)
            .await;
        Ok(true)
    }

    async fn active(&self) -> Result<(Channel, Arc<dyn MachineInstance>)> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| (s.channel.clone(), s.instance.clone()))
            .ok_or_else(|| ChannelError::NotOpen.into())
    }

    fn publish_move(&self, is_moving: bool, is_homing: bool) {
        self.inner
            .bus
            .publish(AppEvent::Machine(MachineEvent::MoveStatus {
                is_moving,
                is_homing,
            }));
    }

    /// Run a command on the open machine
    ///
    /// Returns the firmware output when the command was sent as G-code.
    pub async fn execute(&self, command: MachineCommand) -> Result<String> {
        let (channel, instance) = self.active().await?;
        let motion = match command {
            MachineCommand::Move { .. } => Some(false),
            MachineCommand::Home => Some(true),
            _ => None,
        };
        if let Some(is_homing) = motion {
            self.publish_move(true, is_homing);
        }
        let result = commands::forward(&channel, &command).await;
        if motion.is_some() {
            self.publish_move(false, false);
        }
        if result.is_ok() && matches!(command, MachineCommand::StopPrint) {
            instance.tracker().end_job();
        }
        result
    }

    /// Run raw G-code
    pub async fn execute_gcode(&self, gcode: &str) -> Result<String> {
        self.execute(MachineCommand::Gcode(gcode.to_string())).await
    }

    /// Store a file on the machine, publishing upload progress
    pub async fn upload_file(&self, filename: &str, content: Vec<u8>) -> Result<()> {
        let (channel, _) = self.active().await?;
        let transfer = channel
            .file_transfer()
            .ok_or_else(|| ChannelError::unsupported("file upload", channel.protocol()))?;
        let bus = self.inner.bus.clone();
        let progress = Arc::new(move |p: TransferProgress| {
            bus.publish(AppEvent::Print(PrintEvent::Upload {
                filename: p.filename,
                progress: p.progress,
                decompressing: p.decompressing,
            }));
        });
        transfer.upload_file(filename, content, progress).await
    }

    /// Start a print job and track its progress
    pub async fn start_print(&self, request: PrintRequest) -> Result<()> {
        let (channel, instance) = self.active().await?;
        let printer = channel
            .print_job()
            .ok_or_else(|| ChannelError::unsupported("print", channel.protocol()))?;
        printer.start_print(&request).await?;
        instance
            .tracker()
            .begin_job(&request.filename, request.metadata);
        Ok(())
    }

    /// Controller firmware version
    pub async fn firmware_version(&self) -> Result<String> {
        let (channel, instance) = self.active().await?;
        if let Some(system) = channel.system() {
            return system.firmware_version().await;
        }
        let version = instance.state().firmware_version;
        version.ok_or_else(|| {
            ChannelError::unsupported("firmware version", channel.protocol()).into()
        })
    }

    /// Current Wi-Fi settings of the machine
    pub async fn get_network_config(&self) -> Result<NetworkInfo> {
        let (channel, _) = self.active().await?;
        let network = channel
            .network()
            .ok_or_else(|| ChannelError::unsupported("network config", channel.protocol()))?;
        network.get_network_config().await
    }

    /// Join the machine to a Wi-Fi network
    pub async fn set_network_config(&self, ssid: &str, password: &str) -> Result<()> {
        let (channel, _) = self.active().await?;
        let network = channel
            .network()
            .ok_or_else(|| ChannelError::unsupported("network config", channel.protocol()))?;
        network.set_network_config(ssid, password).await
    }
}
