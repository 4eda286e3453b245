//! Typed SACP payloads
//!
//! Acks and pushes start with a result byte; `decode` takes the bytes after
//! it. `encode` produces the full payload including a success result byte,
//! which is what a machine sends and what the simulated machine uses.

use super::buffer::{PayloadReader, PayloadWriter};
use super::commands::{self, RESULT_OK};
use super::packet::{CommandTag, Packet};
use fablink_core::{
    AirPurifierState, Axis, BedZoneState, EnclosureState, ExtruderState, MachineSeries,
    ModuleInfo, Position, ProtocolError, WorkflowStatus,
};

/// A payload type bound to one command tag
pub trait Telemetry: Sized {
    /// Tag the payload travels under
    const TAG: CommandTag;

    /// Decode from the bytes after the result byte
    fn decode(body: &[u8]) -> Result<Self, ProtocolError>;

    /// Encode with a leading success result byte
    fn encode(&self) -> Vec<u8>;

    /// Decode a pushed or acked packet, rejecting a non-zero result byte
    fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        match packet.result_code() {
            Some(RESULT_OK) => Self::decode(packet.body()),
            Some(code) => Err(ProtocolError::ResultCode {
                command_set: packet.tag.command_set,
                command_id: packet.tag.command_id,
                code,
            }),
            None => Err(ProtocolError::MalformedPayload {
                reason: format!("empty payload for {}", packet.tag),
            }),
        }
    }
}

fn ok() -> PayloadWriter {
    PayloadWriter::new().u8(RESULT_OK)
}

/// Machine identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    /// Raw machine id.
    pub machine_id: u8,
    /// Series derived from the id.
    pub series: MachineSeries,
    /// Hardware revision.
    pub hardware_version: String,
    /// Controller firmware version.
    pub firmware_version: String,
    /// Machine serial number.
    pub serial_number: String,
}

impl MachineInfo {
    /// Build from a raw machine id
    pub fn new(machine_id: u8, firmware_version: impl Into<String>) -> Self {
        Self {
            machine_id,
            series: MachineSeries::from_machine_id(machine_id),
            hardware_version: String::new(),
            firmware_version: firmware_version.into(),
            serial_number: String::new(),
        }
    }
}

impl Telemetry for MachineInfo {
    const TAG: CommandTag = commands::system::MACHINE_INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        let machine_id = r.u8()?;
        Ok(Self {
            machine_id,
            series: MachineSeries::from_machine_id(machine_id),
            hardware_version: r.string()?,
            firmware_version: r.string()?,
            serial_number: r.string()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.machine_id)
            .string(&self.hardware_version)
            .string(&self.firmware_version)
            .string(&self.serial_number)
            .finish()
    }
}

/// Attached modules
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleList(pub Vec<ModuleInfo>);

impl Telemetry for ModuleList {
    const TAG: CommandTag = commands::system::MODULE_INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        let count = r.u8()?;
        let mut modules = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            modules.push(ModuleInfo {
                key: r.u8()?,
                module_id: r.u16()?,
                module_index: r.u8()?,
                module_state: r.u8()?,
                serial_number: r.u32()?,
                hardware_version: r.u8()?,
                firmware_version: r.string()?,
            });
        }
        Ok(Self(modules))
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ok().u8(self.0.len().min(usize::from(u8::MAX)) as u8);
        for m in self.0.iter().take(usize::from(u8::MAX)) {
            w = w
                .u8(m.key)
                .u16(m.module_id)
                .u8(m.module_index)
                .u8(m.module_state)
                .u32(m.serial_number)
                .u8(m.hardware_version)
                .string(&m.firmware_version);
        }
        w.finish()
    }
}

/// Workflow heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Raw status code.
    pub code: u8,
}

impl Heartbeat {
    /// Normalized status
    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus::from_heartbeat(self.code)
    }
}

impl Telemetry for Heartbeat {
    const TAG: CommandTag = commands::system::HEARTBEAT;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: PayloadReader::new(body).u8()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.code).finish()
    }
}

/// Homing state and axis positions
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateInfo {
    /// All axes are homed.
    pub is_homed: bool,
    /// Reported axes in wire order.
    pub coordinates: Vec<(Axis, f64)>,
}

impl CoordinateInfo {
    /// Fold the reported axes into a position
    pub fn position(&self) -> Position {
        let mut position = Position::default();
        for (axis, value) in &self.coordinates {
            position.set_axis(*axis, *value);
        }
        position
    }
}

impl Telemetry for CoordinateInfo {
    const TAG: CommandTag = commands::system::COORDINATE_INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        let is_homed = r.bool()?;
        let count = r.u8()?;
        let mut coordinates = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let code = r.u8()?;
            let value = r.milli()?;
            match Axis::from_code(code) {
                Some(axis) => coordinates.push((axis, value)),
                None => tracing::debug!("Ignoring unknown axis code {}", code),
            }
        }
        Ok(Self {
            is_homed,
            coordinates,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ok().bool(self.is_homed).u8(self.coordinates.len() as u8);
        for (axis, value) in &self.coordinates {
            w = w.u8(axis.code()).milli(*value);
        }
        w.finish()
    }
}

/// Extruder temperatures of one printing head
#[derive(Debug, Clone, PartialEq)]
pub struct NozzleInfo {
    /// Module key.
    pub key: u8,
    /// One entry per extruder.
    pub extruders: Vec<ExtruderState>,
}

impl Telemetry for NozzleInfo {
    const TAG: CommandTag = commands::nozzle::INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        let key = r.u8()?;
        let count = r.u8()?;
        let mut extruders = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            extruders.push(ExtruderState {
                index: r.u8()?,
                current: r.milli()?,
                target: r.milli()?,
            });
        }
        Ok(Self { key, extruders })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ok().u8(self.key).u8(self.extruders.len() as u8);
        for e in &self.extruders {
            w = w.u8(e.index).milli(e.current).milli(e.target);
        }
        w.finish()
    }
}

/// Heated bed zone temperatures
#[derive(Debug, Clone, PartialEq)]
pub struct BedInfo {
    /// Module key.
    pub key: u8,
    /// One entry per zone.
    pub zones: Vec<BedZoneState>,
}

impl Telemetry for BedInfo {
    const TAG: CommandTag = commands::bed::INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        let key = r.u8()?;
        let count = r.u8()?;
        let mut zones = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            zones.push(BedZoneState {
                index: r.u8()?,
                current: r.milli()?,
                target: r.milli()?,
            });
        }
        Ok(Self { key, zones })
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = ok().u8(self.key).u8(self.zones.len() as u8);
        for z in &self.zones {
            w = w.u8(z.index).milli(z.current).milli(z.target);
        }
        w.finish()
    }
}

/// Enclosure light, fan, and door
#[derive(Debug, Clone, PartialEq)]
pub struct EnclosureInfo {
    /// Module key.
    pub key: u8,
    /// Reported state.
    pub state: EnclosureState,
}

impl Telemetry for EnclosureInfo {
    const TAG: CommandTag = commands::enclosure::INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        Ok(Self {
            key: r.u8()?,
            state: EnclosureState {
                light: r.u8()?,
                fan: r.u8()?,
                door_open: r.bool()?,
                door_detection: r.bool()?,
            },
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.key)
            .u8(self.state.light)
            .u8(self.state.fan)
            .bool(self.state.door_open)
            .bool(self.state.door_detection)
            .finish()
    }
}

/// Air purifier state
#[derive(Debug, Clone, PartialEq)]
pub struct PurifierInfo {
    /// Module key.
    pub key: u8,
    /// Reported state.
    pub state: AirPurifierState,
}

impl Telemetry for PurifierInfo {
    const TAG: CommandTag = commands::purifier::INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        Ok(Self {
            key: r.u8()?,
            state: AirPurifierState {
                enabled: r.bool()?,
                fan_speed: r.u8()?,
                filter_life: r.u8()?,
            },
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.key)
            .bool(self.state.enabled)
            .u8(self.state.fan_speed)
            .u8(self.state.filter_life)
            .finish()
    }
}

/// Spindle speed of a CNC head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpindleSpeed {
    /// Module key.
    pub key: u8,
    /// Revolutions per minute.
    pub rpm: u32,
}

impl Telemetry for SpindleSpeed {
    const TAG: CommandTag = commands::cnc::SPEED_INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        Ok(Self {
            key: r.u8()?,
            rpm: r.u32()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.key).u32(self.rpm).finish()
    }
}

/// Output power of a laser head
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserPower {
    /// Module key.
    pub key: u8,
    /// Percent of full power.
    pub percent: f64,
}

impl Telemetry for LaserPower {
    const TAG: CommandTag = commands::laser::POWER_INFO;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        Ok(Self {
            key: r.u8()?,
            percent: r.milli()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u8(self.key).milli(self.percent).finish()
    }
}

/// Line the machine is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    /// Zero-based line.
    pub line: u32,
}

impl Telemetry for LineNumber {
    const TAG: CommandTag = commands::print::LINE_NUMBER;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            line: PayloadReader::new(body).u32()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u32(self.line).finish()
    }
}

/// Print time reported by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedTime {
    /// Seconds since the job started.
    pub secs: u32,
}

impl Telemetry for ElapsedTime {
    const TAG: CommandTag = commands::print::ELAPSED_TIME;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            secs: PayloadReader::new(body).u32()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().u32(self.secs).finish()
    }
}

/// Wi-Fi settings of the machine
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkInfo {
    /// Joined a network.
    pub connected: bool,
    /// Network name.
    pub ssid: String,
    /// Assigned address.
    pub ip: String,
}

impl Telemetry for NetworkInfo {
    const TAG: CommandTag = commands::system::GET_NETWORK;

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(body);
        Ok(Self {
            connected: r.bool()?,
            ssid: r.string()?,
            ip: r.string()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        ok().bool(self.connected)
            .string(&self.ssid)
            .string(&self.ip)
            .finish()
    }
}

/// Error pushed by the machine as a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    /// Severity.
    pub level: u8,
    /// Reporting subsystem.
    pub owner: u16,
    /// Error code.
    pub error_code: u16,
}

impl ErrorReport {
    /// Decode a request payload (no result byte)
    pub fn from_request(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            level: r.u8()?,
            owner: r.u16()?,
            error_code: r.u16()?,
        })
    }

    /// Encode as a request payload
    pub fn to_request(&self) -> Vec<u8> {
        PayloadWriter::new()
            .u8(self.level)
            .u16(self.owner)
            .u16(self.error_code)
            .finish()
    }
}

/// Machine asking the host for the next G-code lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcodeBatchRequest {
    /// First line wanted.
    pub start_line: u32,
    /// Number of lines wanted.
    pub count: u16,
}

impl GcodeBatchRequest {
    /// Decode a request payload
    pub fn from_request(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            start_line: r.u32()?,
            count: r.u16()?,
        })
    }

    /// Encode as a request payload
    pub fn to_request(&self) -> Vec<u8> {
        PayloadWriter::new()
            .u32(self.start_line)
            .u16(self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sacp::packet::PeerId;

    fn pushed<T: Telemetry>(value: &T) -> Packet {
        Packet::request(T::TAG, PeerId::Controller, PeerId::Host, 1, value.encode())
    }

    #[test]
    fn test_machine_info_maps_series() {
        let mut info = MachineInfo::new(2, "1.2.0");
        info.serial_number = "SN-42".to_string();
        let decoded = MachineInfo::from_packet(&pushed(&info)).unwrap();
        assert_eq!(decoded.series, MachineSeries::A350);
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_module_list_layout() {
        let list = ModuleList(vec![ModuleInfo {
            key: 3,
            module_id: 14,
            module_index: 0,
            module_state: 1,
            serial_number: 99,
            hardware_version: 2,
            firmware_version: "v1".to_string(),
        }]);
        let payload = list.encode();
        assert_eq!(&payload[..5], &[0, 1, 3, 14, 0]);
        let decoded = ModuleList::decode(&payload[1..]).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn test_coordinates_fold_into_position() {
        let info = CoordinateInfo {
            is_homed: true,
            coordinates: vec![(Axis::X, 10.5), (Axis::Y, -3.0), (Axis::Z, 120.25)],
        };
        let decoded = CoordinateInfo::from_packet(&pushed(&info)).unwrap();
        let position = decoded.position();
        assert!(decoded.is_homed);
        assert_eq!(position.x, 10.5);
        assert_eq!(position.y, -3.0);
        assert_eq!(position.z, 120.25);
    }

    #[test]
    fn test_unknown_axis_is_skipped() {
        let body = PayloadWriter::new().bool(false).u8(2).u8(9).i32(1).u8(0).i32(2000).finish();
        let decoded = CoordinateInfo::decode(&body).unwrap();
        assert_eq!(decoded.coordinates, vec![(Axis::X, 2.0)]);
    }

    #[test]
    fn test_failed_push_is_rejected() {
        let mut packet = pushed(&Heartbeat { code: 2 });
        packet.payload[0] = 4;
        assert!(matches!(
            Heartbeat::from_packet(&packet),
            Err(ProtocolError::ResultCode { code: 4, .. })
        ));
    }

    #[test]
    fn test_heartbeat_status() {
        assert_eq!(Heartbeat { code: 2 }.status(), WorkflowStatus::Running);
        assert_eq!(Heartbeat { code: 3 }.status(), WorkflowStatus::Paused);
    }

    #[test]
    fn test_request_payloads() {
        let report = ErrorReport {
            level: 2,
            owner: 0x0010,
            error_code: 0x0203,
        };
        assert_eq!(ErrorReport::from_request(&report.to_request()).unwrap(), report);

        let batch = GcodeBatchRequest {
            start_line: 100,
            count: 20,
        };
        assert_eq!(batch.to_request(), vec![100, 0, 0, 0, 20, 0]);
    }

    #[test]
    fn test_truncated_nozzle_info() {
        let info = NozzleInfo {
            key: 1,
            extruders: vec![ExtruderState {
                index: 0,
                current: 200.0,
                target: 210.0,
            }],
        };
        let payload = info.encode();
        let err = NozzleInfo::decode(&payload[1..payload.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
    }
}
