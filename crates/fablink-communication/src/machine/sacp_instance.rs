//! Binary-protocol machine instance
//!
//! Telemetry is pushed by the machine: one subscription per sample kind the
//! attached modules produce, plus coordinates and print progress. The
//! heartbeat's workflow status comes through the channel's status watch.

use super::{MachineInstance, StateTracker};
use crate::channel::{ChannelLifecycle, SacpChannel};
use crate::sacp::commands::{report, RESULT_OK};
use crate::sacp::dispatcher::SubscriptionId;
use crate::sacp::packet::CommandTag;
use crate::sacp::telemetry::{
    BedInfo, CoordinateInfo, ElapsedTime, EnclosureInfo, ErrorReport, LaserPower, LineNumber,
    NozzleInfo, PurifierInfo, SpindleSpeed, Telemetry,
};
use crate::sacp::SacpClient;
use async_trait::async_trait;
use fablink_core::{
    AppEvent, ErrorEvent, EventBus, HeadType, MachineSeries, MachineState, ModuleKind, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Push interval requested for telemetry subscriptions
pub const TELEMETRY_INTERVAL_MS: u16 = 1000;

/// Machine behind a binary-protocol channel
pub struct SacpInstance {
    channel: Arc<SacpChannel>,
    series: MachineSeries,
    bus: Arc<EventBus>,
    tracker: Arc<StateTracker>,
    subscriptions: Mutex<Vec<(CommandTag, SubscriptionId)>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl SacpInstance {
    /// Bind to an open channel
    pub fn new(channel: Arc<SacpChannel>, series: MachineSeries, bus: Arc<EventBus>) -> Self {
        let state = MachineState::new(channel.protocol(), series);
        Self {
            tracker: Arc::new(StateTracker::new(bus.clone(), state)),
            channel,
            series,
            bus,
            subscriptions: Mutex::new(Vec::new()),
            status_task: Mutex::new(None),
        }
    }

    async fn subscribe<T, F>(&self, client: &SacpClient, callback: F)
    where
        T: Telemetry + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        match client.subscribe::<T, _>(TELEMETRY_INTERVAL_MS, callback).await {
            Ok(id) => self.subscriptions.lock().push((T::TAG, id)),
            Err(e) => tracing::warn!("Subscription to {} refused: {}", T::TAG, e),
        }
    }

    async fn wire_telemetry(&self, client: &SacpClient, state: &MachineState) {
        let tracker = self.tracker.clone();
        self.subscribe::<CoordinateInfo, _>(client, move |info| {
            tracker.update(|s| {
                s.is_homed = info.is_homed;
                s.position = info.position();
            })
        })
        .await;

        if state.head_type == HeadType::Printing {
            let tracker = self.tracker.clone();
            self.subscribe::<NozzleInfo, _>(client, move |info| {
                tracker.update(|s| info.extruders.iter().for_each(|e| s.set_nozzle(*e)))
            })
            .await;
            let tracker = self.tracker.clone();
            self.subscribe::<BedInfo, _>(client, move |info| {
                tracker.update(|s| info.zones.iter().for_each(|z| s.set_bed_zone(*z)))
            })
            .await;
        }
        if state.head_type == HeadType::Laser {
            let tracker = self.tracker.clone();
            self.subscribe::<LaserPower, _>(client, move |info| {
                tracker.update(|s| s.laser_power = Some(info.percent))
            })
            .await;
        }
        if state.head_type == HeadType::Cnc {
            let tracker = self.tracker.clone();
            self.subscribe::<SpindleSpeed, _>(client, move |info| {
                tracker.update(|s| s.spindle_speed = Some(info.rpm))
            })
            .await;
        }
        if state.enclosure.is_some() {
            let tracker = self.tracker.clone();
            self.subscribe::<EnclosureInfo, _>(client, move |info| {
                tracker.update(|s| s.enclosure = Some(info.state))
            })
            .await;
        }
        if state.air_purifier.is_some() {
            let tracker = self.tracker.clone();
            self.subscribe::<PurifierInfo, _>(client, move |info| {
                tracker.update(|s| s.air_purifier = Some(info.state))
            })
            .await;
        }

        let tracker = self.tracker.clone();
        self.subscribe::<LineNumber, _>(client, move |info| tracker.on_line(info.line))
            .await;
        let tracker = self.tracker.clone();
        self.subscribe::<ElapsedTime, _>(client, move |info| {
            tracker.on_elapsed(u64::from(info.secs))
        })
        .await;
    }

    fn watch_status(&self) -> JoinHandle<()> {
        let mut status = self.channel.status();
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            loop {
                let current = *status.borrow_and_update();
                tracker.update(|s| s.status = current);
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn register_error_handler(&self, client: &SacpClient) {
        let bus = self.bus.clone();
        client.dispatcher().set_handler(report::ERROR, move |d, packet| {
            match ErrorReport::from_request(&packet.payload) {
                Ok(report) => {
                    tracing::warn!(
                        "Machine error {} from owner {} (level {})",
                        report.error_code,
                        report.owner,
                        report.level
                    );
                    bus.publish(AppEvent::Error(ErrorEvent::Manager {
                        level: report.level,
                        owner: report.owner,
                        error_code: report.error_code,
                    }));
                }
                Err(e) => tracing::warn!("Unreadable error report: {}", e),
            }
            if let Err(e) = d.ack(&packet, vec![RESULT_OK]) {
                tracing::debug!("Could not acknowledge error report: {}", e);
            }
        });
    }
}

#[async_trait]
impl MachineInstance for SacpInstance {
    fn series(&self) -> MachineSeries {
        self.series
    }

    fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    async fn on_prepare(&self) -> Result<MachineState> {
        let client = self.channel.client()?;
        let modules = self.channel.refresh_modules().await?;
        let coordinates = client.get_coordinate_info().await?;

        let mut state = MachineState::new(self.channel.protocol(), self.series);
        state.head_type = modules.head_type();
        state.is_homed = coordinates.is_homed;
        state.position = coordinates.position();
        state.has_rotary = modules.has(ModuleKind::Rotary);
        state.has_emergency_stop = modules.has(ModuleKind::EmergencyStop);
        if modules.has(ModuleKind::Enclosure) {
            state.enclosure = Some(Default::default());
        }
        if modules.has(ModuleKind::AirPurifier) {
            state.air_purifier = Some(Default::default());
        }
        state.firmware_version = self.channel.machine_info().map(|i| i.firmware_version);
        state.status = *self.channel.status().borrow();
        self.tracker.reset(state.clone());

        self.channel.start_heartbeat().await?;
        *self.status_task.lock() = Some(self.watch_status());
        self.wire_telemetry(&client, &state).await;
        if self.quirks().reports_errors {
            self.register_error_handler(&client);
        }

        tracing::info!(
            "{} prepared: {} head, homed {}, {} subscriptions",
            self.series,
            state.head_type,
            state.is_homed,
            self.subscriptions.lock().len()
        );
        Ok(state)
    }

    async fn on_closing(&self) {
        if let Some(task) = self.status_task.lock().take() {
            task.abort();
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let Ok(client) = self.channel.client() else {
            return;
        };
        let dispatcher = client.dispatcher();
        dispatcher.remove_handler(report::ERROR);
        for (tag, id) in subscriptions {
            if let Err(e) = dispatcher.unsubscribe(tag, id).await {
                tracing::debug!("Unsubscribe from {} failed: {}", tag, e);
            }
        }
        self.channel.stop_heartbeat().await;
        self.tracker.end_job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{SacpChannelConfig, SacpTransport};
    use crate::link::MockLinkOpener;
    use crate::sacp::commands::{bed, enclosure, laser, nozzle, system};
    use crate::testing::{module, FakeMachine};
    use fablink_core::Position;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn prepared(
        series: MachineSeries,
        modules: Vec<fablink_core::ModuleInfo>,
    ) -> (SacpInstance, FakeMachine, Arc<EventBus>) {
        let opener = Arc::new(MockLinkOpener::new("instance"));
        let machine = FakeMachine::attach(&opener)
            .with_series(series)
            .with_modules(modules)
            .with_homed(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Arc::new(SacpChannel::new(
            SacpTransport::Tcp,
            opener,
            SacpChannelConfig::default(),
            tx,
        ));
        channel.connection_open().await.unwrap();
        let bus = Arc::new(EventBus::recording());
        let instance = SacpInstance::new(channel, series, bus.clone());
        (instance, machine, bus)
    }

    #[tokio::test]
    async fn test_prepare_classifies_modules() {
        let (instance, machine, _bus) = prepared(
            MachineSeries::A350,
            vec![module(1, 14, 0), module(2, 16, 0), module(3, 5, 0)],
        )
        .await;

        let state = instance.on_prepare().await.unwrap();
        assert_eq!(state.head_type, HeadType::Laser);
        assert!(state.enclosure.is_some());
        assert!(state.has_rotary);
        assert!(!state.is_homed);
        assert_eq!(
            instance.connect_warning(&state).as_deref(),
            Some("machine is not homed")
        );

        let subscribed: Vec<CommandTag> = machine
            .received(system::SUBSCRIBE)
            .iter()
            .map(|p| CommandTag::new(p.payload[0], p.payload[1]))
            .collect();
        assert!(subscribed.contains(&laser::POWER_INFO));
        assert!(subscribed.contains(&enclosure::INFO));
        assert!(!subscribed.contains(&nozzle::INFO));
        assert!(!subscribed.contains(&bed::INFO));
    }

    #[tokio::test]
    async fn test_pushes_fold_into_state() {
        let (instance, machine, bus) =
            prepared(MachineSeries::A250, vec![module(4, 13, 0)]).await;
        instance.on_prepare().await.unwrap();

        machine
            .push(&CoordinateInfo {
                is_homed: true,
                coordinates: vec![
                    (fablink_core::Axis::X, 10.0),
                    (fablink_core::Axis::Y, 20.0),
                    (fablink_core::Axis::Z, 5.0),
                ],
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = instance.state();
        assert!(state.is_homed);
        assert_eq!(state.position, Position::new(10.0, 20.0, 5.0));
        assert!(!bus.history_named("Marlin:state").is_empty());
    }

    #[tokio::test]
    async fn test_error_reports_on_j1() {
        let (instance, machine, bus) = prepared(MachineSeries::J1, vec![]).await;
        instance.on_prepare().await.unwrap();

        let report = ErrorReport {
            level: 2,
            owner: 6,
            error_code: 513,
        };
        let ack = machine.request(report::ERROR, report.to_request()).await.unwrap();
        assert_eq!(ack.payload, vec![RESULT_OK]);
        assert_eq!(
            bus.history_named("manager:error"),
            vec![AppEvent::Error(ErrorEvent::Manager {
                level: 2,
                owner: 6,
                error_code: 513,
            })]
        );
    }

    #[tokio::test]
    async fn test_closing_unsubscribes() {
        let (instance, machine, _bus) =
            prepared(MachineSeries::A350, vec![module(1, 1, 0)]).await;
        instance.on_prepare().await.unwrap();
        let subscribed = machine.count(system::SUBSCRIBE);

        instance.on_closing().await;
        // The heartbeat subscription goes too.
        assert_eq!(machine.count(system::UNSUBSCRIBE), subscribed);
    }
}
