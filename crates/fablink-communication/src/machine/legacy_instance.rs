//! Legacy machine instance
//!
//! Text-serial and HTTP channels already poll their machines; this instance
//! only folds the resulting [`LegacySample`]s into the tracked state.

use super::{MachineInstance, StateTracker};
use crate::channel::{LegacySample, LegacyTelemetry, ReadyInfo};
use async_trait::async_trait;
use fablink_core::{
    BedZoneState, EventBus, ExtruderState, MachineSeries, MachineState, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Machine behind a text-serial or HTTP channel
pub struct LegacyInstance {
    telemetry: LegacyTelemetry,
    ready: ReadyInfo,
    tracker: Arc<StateTracker>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LegacyInstance {
    pub fn new(telemetry: LegacyTelemetry, ready: ReadyInfo, bus: Arc<EventBus>) -> Self {
        let state = initial_state(&ready);
        Self {
            telemetry,
            ready,
            tracker: Arc::new(StateTracker::new(bus, state)),
            task: Mutex::new(None),
        }
    }
}

fn initial_state(ready: &ReadyInfo) -> MachineState {
    let mut state = MachineState::new(ready.protocol, ready.series);
    state.head_type = ready.head_type;
    state.firmware_version = ready.firmware_version.clone();
    state
}

/// Fold one sample into the state
pub fn apply_sample(state: &mut MachineState, sample: &LegacySample) {
    if let Some(status) = sample.status {
        state.status = status;
    }
    if let Some(position) = sample.position {
        state.position = position;
    }
    if let Some(is_homed) = sample.is_homed {
        state.is_homed = is_homed;
    }
    if let Some((current, target)) = sample.nozzle {
        state.set_nozzle(ExtruderState {
            index: 0,
            current,
            target,
        });
    }
    if let Some((current, target)) = sample.bed {
        state.set_bed_zone(BedZoneState {
            index: 0,
            current,
            target,
        });
    }
    if sample.laser_power.is_some() {
        state.laser_power = sample.laser_power;
    }
    if sample.spindle_speed.is_some() {
        state.spindle_speed = sample.spindle_speed;
    }
    if sample.enclosure.is_some() {
        state.enclosure = sample.enclosure;
    }
    if sample.air_purifier.is_some() {
        state.air_purifier = sample.air_purifier;
    }
}

#[async_trait]
impl MachineInstance for LegacyInstance {
    fn series(&self) -> MachineSeries {
        self.ready.series
    }

    fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    async fn on_prepare(&self) -> Result<MachineState> {
        let mut samples = self.telemetry.subscribe();
        let tracker = self.tracker.clone();
        let task = tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(sample) => {
                        tracker.update(|s| apply_sample(s, &sample));
                        if let Some(line) = sample.current_line {
                            tracker.on_line(line);
                        }
                        if let Some(secs) = sample.elapsed_secs {
                            tracker.on_elapsed(secs);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!("Skipped {} legacy samples", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(self.tracker.state())
    }

    async fn on_closing(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.tracker.end_job();
    }

    /// Legacy firmware does not report homing reliably
    fn connect_warning(&self, _state: &MachineState) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fablink_core::{HeadType, Position, Protocol, WorkflowStatus};
    use std::time::Duration;

    fn ready() -> ReadyInfo {
        ReadyInfo {
            protocol: Protocol::Http,
            series: MachineSeries::A350,
            head_type: HeadType::Printing,
            firmware_version: Some("1.14.2".to_string()),
        }
    }

    #[test]
    fn test_partial_sample_keeps_other_fields() {
        let mut state = initial_state(&ready());
        state.position = Position::new(1.0, 2.0, 3.0);
        apply_sample(
            &mut state,
            &LegacySample {
                nozzle: Some((180.5, 200.0)),
                status: Some(WorkflowStatus::Running),
                ..Default::default()
            },
        );
        assert_eq!(state.position, Position::new(1.0, 2.0, 3.0));
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.nozzles.len(), 1);
        assert_eq!(state.nozzles[0].current, 180.5);
        assert_eq!(state.head_type, HeadType::Printing);
    }

    #[tokio::test]
    async fn test_samples_reach_the_bus() {
        let telemetry = LegacyTelemetry::new();
        let bus = Arc::new(EventBus::recording());
        let instance = LegacyInstance::new(telemetry.clone(), ready(), bus.clone());
        let state = instance.on_prepare().await.unwrap();
        assert_eq!(state.firmware_version.as_deref(), Some("1.14.2"));
        assert!(instance.connect_warning(&state).is_none());

        telemetry.publish(LegacySample {
            is_homed: Some(true),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(instance.state().is_homed);
        assert_eq!(bus.history_named("Marlin:state").len(), 1);

        instance.on_closing().await;
        telemetry.publish(LegacySample {
            is_homed: Some(false),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(instance.state().is_homed);
    }
}
