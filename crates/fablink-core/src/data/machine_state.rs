//! Normalized machine state snapshot
//!
//! Telemetry callbacks fold their latest sample into one `MachineState`
//! which is re-emitted to the caller regardless of the protocol underneath.

use super::{HeadType, MachineSeries, Position, Protocol, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// Temperature of one extruder
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtruderState {
    /// Extruder index (0 for single heads)
    pub index: u8,
    /// Current temperature in °C
    pub current: f64,
    /// Target temperature in °C
    pub target: f64,
}

/// Temperature of one heated bed zone
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BedZoneState {
    /// Zone index
    pub index: u8,
    /// Current temperature in °C
    pub current: f64,
    /// Target temperature in °C
    pub target: f64,
}

/// Enclosure telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnclosureState {
    /// Light intensity (0-100)
    pub light: u8,
    /// Fan speed (0-100)
    pub fan: u8,
    /// Door currently open
    pub door_open: bool,
    /// Door detection enabled
    pub door_detection: bool,
}

/// Air purifier telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AirPurifierState {
    /// Purifier switched on
    pub enabled: bool,
    /// Fan speed level
    pub fan_speed: u8,
    /// Remaining filter lifetime level
    pub filter_life: u8,
}

/// Latest known machine state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineState {
    /// Machine family
    pub series: MachineSeries,
    /// Protocol of the active channel
    pub protocol: Protocol,
    /// Coarse workflow status
    pub status: WorkflowStatus,
    /// Mounted tool head type
    pub head_type: HeadType,
    /// Whether the machine has been homed
    pub is_homed: bool,
    /// Machine position
    pub position: Position,
    /// Extruder temperatures
    pub nozzles: Vec<ExtruderState>,
    /// Heated bed temperatures
    pub bed_zones: Vec<BedZoneState>,
    /// Laser power in percent
    pub laser_power: Option<f64>,
    /// Spindle speed in RPM
    pub spindle_speed: Option<u32>,
    /// Enclosure telemetry, if an enclosure is attached
    pub enclosure: Option<EnclosureState>,
    /// Purifier telemetry, if a purifier is attached
    pub air_purifier: Option<AirPurifierState>,
    /// Rotary module attached
    pub has_rotary: bool,
    /// Emergency stop button attached
    pub has_emergency_stop: bool,
    /// Firmware version string
    pub firmware_version: Option<String>,
}

impl MachineState {
    /// Fresh state for a connection on the given protocol
    pub fn new(protocol: Protocol, series: MachineSeries) -> Self {
        Self {
            protocol,
            series,
            ..Default::default()
        }
    }

    /// Replace or insert the state of one extruder
    pub fn set_nozzle(&mut self, nozzle: ExtruderState) {
        match self.nozzles.iter_mut().find(|n| n.index == nozzle.index) {
            Some(existing) => *existing = nozzle,
            None => {
                self.nozzles.push(nozzle);
                self.nozzles.sort_by_key(|n| n.index);
            }
        }
    }

    /// Replace or insert the state of one bed zone
    pub fn set_bed_zone(&mut self, zone: BedZoneState) {
        match self.bed_zones.iter_mut().find(|z| z.index == zone.index) {
            Some(existing) => *existing = zone,
            None => {
                self.bed_zones.push(zone);
                self.bed_zones.sort_by_key(|z| z.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_nozzle_replaces_by_index() {
        let mut state = MachineState::new(Protocol::SacpOverTcp, MachineSeries::J1);
        state.set_nozzle(ExtruderState {
            index: 1,
            current: 20.0,
            target: 0.0,
        });
        state.set_nozzle(ExtruderState {
            index: 0,
            current: 21.0,
            target: 0.0,
        });
        state.set_nozzle(ExtruderState {
            index: 1,
            current: 180.0,
            target: 200.0,
        });

        assert_eq!(state.nozzles.len(), 2);
        assert_eq!(state.nozzles[0].index, 0);
        assert_eq!(state.nozzles[1].current, 180.0);
    }

    #[test]
    fn test_set_bed_zone() {
        let mut state = MachineState::default();
        state.set_bed_zone(BedZoneState {
            index: 0,
            current: 50.0,
            target: 60.0,
        });
        state.set_bed_zone(BedZoneState {
            index: 0,
            current: 59.0,
            target: 60.0,
        });
        assert_eq!(state.bed_zones.len(), 1);
        assert_eq!(state.bed_zones[0].current, 59.0);
    }
}
