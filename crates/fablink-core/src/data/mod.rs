//! Data models shared by every layer
//!
//! This module provides:
//! - The wire protocol enumeration produced by detection
//! - Machine workflow status and machine series identification
//! - Axis and position types used by movement commands and telemetry
//! - Module descriptors discovered on connect
//! - The normalized machine state snapshot and print job bookkeeping

pub mod machine_state;
pub mod modules;
pub mod print_job;

pub use machine_state::{
    AirPurifierState, BedZoneState, EnclosureState, ExtruderState, MachineState,
};
pub use modules::{ModuleInfo, ModuleKind, ModuleTable};
pub use print_job::{GcodeMetadata, PrintJob, PrintProgress};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol spoken by a machine, as determined by detection or a caller hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Line-oriented G-code over a serial port
    PlainText,
    /// Binary framed protocol over a serial port
    SacpOverSerial,
    /// Binary framed protocol over TCP
    SacpOverTcp,
    /// Binary framed protocol over UDP
    SacpOverUdp,
    /// Legacy REST interface exposed by the touch screen
    Http,
    /// Nothing answered during detection
    #[default]
    Unknown,
}

impl Protocol {
    /// True for the three binary protocol variants
    pub fn is_sacp(&self) -> bool {
        matches!(
            self,
            Self::SacpOverSerial | Self::SacpOverTcp | Self::SacpOverUdp
        )
    }

    /// True for protocols that need G-code synthesis for typed commands
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::PlainText | Self::Http)
    }

    /// True when the protocol runs over a network transport
    pub fn is_network(&self) -> bool {
        matches!(self, Self::SacpOverTcp | Self::SacpOverUdp | Self::Http)
    }

    /// True when the protocol runs over a serial port
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::PlainText | Self::SacpOverSerial)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlainText => write!(f, "plain_text"),
            Self::SacpOverSerial => write!(f, "sacp_over_serial"),
            Self::SacpOverTcp => write!(f, "sacp_over_tcp"),
            Self::SacpOverUdp => write!(f, "sacp_over_udp"),
            Self::Http => write!(f, "http"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain_text" | "text" | "marlin" => Ok(Self::PlainText),
            "sacp_over_serial" | "sacp-serial" => Ok(Self::SacpOverSerial),
            "sacp_over_tcp" | "sacp-tcp" | "sacp" => Ok(Self::SacpOverTcp),
            "sacp_over_udp" | "sacp-udp" => Ok(Self::SacpOverUdp),
            "http" => Ok(Self::Http),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Coarse execution state of the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkflowStatus {
    /// Nothing running
    Idle,
    /// A job is being prepared
    Starting,
    /// A job is running
    Running,
    /// A job is paused
    Paused,
    /// No status received yet
    #[default]
    Unknown,
}

impl WorkflowStatus {
    /// Map the status byte carried by the heartbeat frame
    pub fn from_heartbeat(code: u8) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Starting,
            2 | 5 | 7 | 9 | 10 => Self::Running,
            3 | 4 => Self::Paused,
            6 | 8 => Self::Idle,
            _ => Self::Unknown,
        }
    }

    /// Map the status string reported by the legacy HTTP interface
    pub fn from_http(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "IDLE" | "STOPPED" | "COMPLETED" => Self::Idle,
            "STARTING" | "PREPARING" => Self::Starting,
            "RUNNING" | "RESUMING" | "STOPPING" => Self::Running,
            "PAUSED" | "PAUSING" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    /// True while a job occupies the machine
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Machine family reported when a channel becomes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MachineSeries {
    /// First generation, legacy protocols only
    Original,
    /// Small modular machine
    A150,
    /// Medium modular machine
    A250,
    /// Large modular machine
    A350,
    /// Large enclosed machine with quick-swap heads
    Artisan,
    /// Dual extruder printer
    J1,
    /// Laser-only machine
    Ray,
    /// Could not be identified
    #[default]
    Unknown,
}

impl MachineSeries {
    /// Map the series byte of the machine info response
    pub fn from_machine_id(id: u8) -> Self {
        match id {
            0 => Self::A150,
            1 => Self::A250,
            2 => Self::A350,
            3 => Self::Artisan,
            4 => Self::J1,
            5 => Self::Ray,
            6 => Self::Original,
            _ => Self::Unknown,
        }
    }

    /// Series byte as sent in the machine info response
    pub fn machine_id(&self) -> Option<u8> {
        match self {
            Self::A150 => Some(0),
            Self::A250 => Some(1),
            Self::A350 => Some(2),
            Self::Artisan => Some(3),
            Self::J1 => Some(4),
            Self::Ray => Some(5),
            Self::Original => Some(6),
            Self::Unknown => None,
        }
    }

    /// Map a model name such as reported by the legacy firmware or screen
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_uppercase();
        match name.as_str() {
            "A150" | "S" => Self::A150,
            "A250" | "M" => Self::A250,
            "A350" | "L" => Self::A350,
            "A400" | "ARTISAN" => Self::Artisan,
            "J1" => Self::J1,
            "RAY" => Self::Ray,
            "ORIGINAL" => Self::Original,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MachineSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => write!(f, "Original"),
            Self::A150 => write!(f, "A150"),
            Self::A250 => write!(f, "A250"),
            Self::A350 => write!(f, "A350"),
            Self::Artisan => write!(f, "Artisan"),
            Self::J1 => write!(f, "J1"),
            Self::Ray => write!(f, "Ray"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kind of tool head currently mounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HeadType {
    /// Extruder head (single or dual)
    Printing,
    /// Laser head
    Laser,
    /// Spindle head
    Cnc,
    /// Nothing classified yet
    #[default]
    Unknown,
}

impl HeadType {
    /// Map the tool head name used by the legacy interfaces
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("laser") {
            Self::Laser
        } else if name.contains("cnc") {
            Self::Cnc
        } else if name.contains("print") || name.contains("extruder") {
            Self::Printing
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Printing => write!(f, "printing"),
            Self::Laser => write!(f, "laser"),
            Self::Cnc => write!(f, "cnc"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Machine axis identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X-axis
    X,
    /// Y-axis
    Y,
    /// Z-axis
    Z,
    /// A-axis
    A,
    /// B-axis (rotary module)
    B,
    /// C-axis
    C,
}

impl Axis {
    /// Axis code used on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::A => 3,
            Self::B => 4,
            Self::C => 5,
        }
    }

    /// Axis from its wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            3 => Some(Self::A),
            4 => Some(Self::B),
            5 => Some(Self::C),
            _ => None,
        }
    }

    /// G-code letter for this axis
    pub fn letter(&self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
        }
    }
}

/// Machine position in millimeters (B in degrees)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// Rotary axis position
    pub b: f64,
}

impl Position {
    /// Create a position from its linear axes
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, b: 0.0 }
    }

    /// Set one axis value; axes without a slot here are ignored
    pub fn set_axis(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::B => self.b = value,
            Axis::A | Axis::C => {}
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X:{:.3} Y:{:.3} Z:{:.3} B:{:.3}",
            self.x, self.y, self.z, self.b
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(Protocol::SacpOverTcp.is_sacp());
        assert!(Protocol::SacpOverUdp.is_network());
        assert!(Protocol::Http.is_legacy());
        assert!(Protocol::PlainText.is_serial());
        assert!(!Protocol::Unknown.is_sacp());
        assert!(!Protocol::Unknown.is_legacy());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("sacp".parse::<Protocol>().unwrap(), Protocol::SacpOverTcp);
        assert_eq!(
            "SACP_OVER_SERIAL".parse::<Protocol>().unwrap(),
            Protocol::SacpOverSerial
        );
        assert!("websocket".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_workflow_status_mapping() {
        assert_eq!(WorkflowStatus::from_heartbeat(0), WorkflowStatus::Idle);
        assert_eq!(WorkflowStatus::from_heartbeat(2), WorkflowStatus::Running);
        assert_eq!(WorkflowStatus::from_heartbeat(4), WorkflowStatus::Paused);
        assert_eq!(WorkflowStatus::from_heartbeat(200), WorkflowStatus::Unknown);
        assert_eq!(WorkflowStatus::from_http("PAUSED"), WorkflowStatus::Paused);
        assert!(WorkflowStatus::Starting.is_busy());
        assert!(!WorkflowStatus::Idle.is_busy());
    }

    #[test]
    fn test_series_mapping() {
        assert_eq!(MachineSeries::from_machine_id(4), MachineSeries::J1);
        assert_eq!(MachineSeries::from_name("L"), MachineSeries::A350);
        assert_eq!(MachineSeries::from_name("a400"), MachineSeries::Artisan);
        assert_eq!(MachineSeries::from_name("??"), MachineSeries::Unknown);
    }

    #[test]
    fn test_axis_codes_roundtrip() {
        for axis in [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C] {
            assert_eq!(Axis::from_code(axis.code()), Some(axis));
        }
        assert_eq!(Axis::from_code(9), None);
    }

    #[test]
    fn test_head_type_from_name() {
        assert_eq!(HeadType::from_name("TOOLHEAD_LASER_1"), HeadType::Laser);
        assert_eq!(HeadType::from_name("cnc"), HeadType::Cnc);
        assert_eq!(HeadType::from_name("3dp printing"), HeadType::Printing);
    }
}
