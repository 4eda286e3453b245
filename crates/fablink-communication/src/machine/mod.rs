//! Machine instances
//!
//! One instance is created per session once the channel reports `Ready`.
//! `on_prepare` discovers modules, reads the homed flag, and wires telemetry
//! into a [`StateTracker`], which folds every sample into one
//! [`MachineState`] and re-emits it on the event bus. `on_closing` unwinds
//! the wiring again.
//!
//! Machine families differ only in small quirks; see [`quirks_for`].

pub mod legacy_instance;
pub mod sacp_instance;

use async_trait::async_trait;
use chrono::Utc;
use fablink_core::{
    AppEvent, EventBus, GcodeMetadata, MachineEvent, MachineSeries, MachineState, PrintEvent,
    PrintJob, PrintProgress, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

pub use legacy_instance::LegacyInstance;
pub use sacp_instance::SacpInstance;

/// Per-family differences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineQuirks {
    /// Commands expect a homed machine; an unhomed one is reported at connect.
    pub requires_homing: bool,
    /// The firmware sends machine-initiated error reports.
    pub reports_errors: bool,
}

/// Quirks of a machine family
pub fn quirks_for(series: MachineSeries) -> MachineQuirks {
    match series {
        MachineSeries::Ray => MachineQuirks {
            requires_homing: false,
            reports_errors: false,
        },
        MachineSeries::J1 | MachineSeries::Artisan => MachineQuirks {
            requires_homing: true,
            reports_errors: true,
        },
        _ => MachineQuirks {
            requires_homing: true,
            reports_errors: false,
        },
    }
}

/// Latest machine state and the running job, shared with telemetry callbacks
pub struct StateTracker {
    bus: Arc<EventBus>,
    state: RwLock<MachineState>,
    job: Mutex<Option<PrintJob>>,
}

impl StateTracker {
    /// Track `initial`, publishing to `bus`
    pub fn new(bus: Arc<EventBus>, initial: MachineState) -> Self {
        Self {
            bus,
            state: RwLock::new(initial),
            job: Mutex::new(None),
        }
    }

    /// Current snapshot
    pub fn state(&self) -> MachineState {
        self.state.read().clone()
    }

    /// Edit the state and publish it if anything changed
    pub fn update(&self, edit: impl FnOnce(&mut MachineState)) {
        let snapshot = {
            let mut state = self.state.write();
            let before = state.clone();
            edit(&mut state);
            if *state == before {
                return;
            }
            state.clone()
        };
        self.bus
            .publish(AppEvent::Machine(MachineEvent::State(Box::new(snapshot))));
    }

    /// Replace the state without publishing
    pub fn reset(&self, state: MachineState) {
        *self.state.write() = state;
    }

    /// Start tracking a job
    pub fn begin_job(&self, filename: &str, metadata: GcodeMetadata) {
        *self.job.lock() = Some(PrintJob::new(filename, metadata));
        tracing::info!("Print job {} started ({} lines)", filename, metadata.total_lines);
        self.bus.publish(AppEvent::Print(PrintEvent::Started {
            filename: filename.to_string(),
        }));
    }

    /// Stop tracking the job; returns whether one was running
    pub fn end_job(&self) -> bool {
        let Some(job) = self.job.lock().take() else {
            return false;
        };
        self.bus.publish(AppEvent::Print(PrintEvent::Finished {
            filename: job.filename,
        }));
        true
    }

    /// Fold in a line-number sample
    pub fn on_line(&self, line: u32) {
        let (progress, complete) = {
            let mut job = self.job.lock();
            let Some(job) = job.as_mut() else {
                return;
            };
            (job.update_line(line, Utc::now()), job.is_complete())
        };
        self.bus.publish(AppEvent::Print(PrintEvent::Status(progress)));
        if complete {
            self.end_job();
        }
    }

    /// Fold in an elapsed-time sample
    pub fn on_elapsed(&self, secs: u64) {
        if let Some(job) = self.job.lock().as_mut() {
            job.update_elapsed(secs);
        }
    }

    /// Progress of the running job
    pub fn progress(&self) -> Option<PrintProgress> {
        self.job.lock().as_ref().map(|job| job.snapshot(Utc::now()))
    }
}

/// Per-session orchestration of one machine
#[async_trait]
pub trait MachineInstance: Send + Sync {
    /// Family of the machine
    fn series(&self) -> MachineSeries;

    /// State shared with the telemetry wiring
    fn tracker(&self) -> &Arc<StateTracker>;

    /// Discover modules and wire telemetry; returns the connected state
    async fn on_prepare(&self) -> Result<MachineState>;

    /// Unwire telemetry and handlers
    async fn on_closing(&self);

    /// Quirks of the family
    fn quirks(&self) -> MachineQuirks {
        quirks_for(self.series())
    }

    /// Current state snapshot
    fn state(&self) -> MachineState {
        self.tracker().state()
    }

    /// Problem worth reporting alongside the connected state
    fn connect_warning(&self, state: &MachineState) -> Option<String> {
        (self.quirks().requires_homing && !state.is_homed)
            .then(|| "machine is not homed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fablink_core::Protocol;

    fn tracker() -> (Arc<EventBus>, StateTracker) {
        let bus = Arc::new(EventBus::recording());
        let tracker = StateTracker::new(
            bus.clone(),
            MachineState::new(Protocol::SacpOverTcp, MachineSeries::A350),
        );
        (bus, tracker)
    }

    #[test]
    fn test_quirks() {
        assert!(!quirks_for(MachineSeries::Ray).requires_homing);
        assert!(quirks_for(MachineSeries::J1).reports_errors);
        assert!(quirks_for(MachineSeries::Artisan).reports_errors);
        assert!(!quirks_for(MachineSeries::A250).reports_errors);
    }

    #[test]
    fn test_update_publishes_only_changes() {
        let (bus, tracker) = tracker();
        tracker.update(|s| s.is_homed = true);
        tracker.update(|s| s.is_homed = true);
        assert_eq!(bus.history_named("Marlin:state").len(), 1);
        assert!(tracker.state().is_homed);
    }

    #[test]
    fn test_job_finishes_on_last_line() {
        let (bus, tracker) = tracker();
        tracker.on_line(3);
        assert!(bus.history_named("sender:status").is_empty());

        let metadata = GcodeMetadata {
            total_lines: 4,
            estimated_time_secs: Some(40),
        };
        tracker.begin_job("cube.gcode", metadata);
        tracker.on_line(2);
        let progress = tracker.progress().unwrap();
        assert_eq!(progress.progress, 0.5);
        assert_eq!(progress.remaining_secs, Some(20));

        tracker.on_line(4);
        assert!(tracker.progress().is_none());
        assert_eq!(bus.history_named("sender:start").len(), 1);
        assert_eq!(bus.history_named("sender:status").len(), 2);
        assert_eq!(bus.history_named("sender:end").len(), 1);
        assert!(!tracker.end_job());
    }
}
