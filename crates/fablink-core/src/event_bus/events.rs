//! Event type definitions for the event bus.
//!
//! These are the normalized, transport-agnostic events the connection
//! manager re-emits to its caller. Each event also knows the legacy
//! colon-separated name (`connection:open`, `Marlin:state`, ...) existing
//! front-ends subscribe to.

use serde::{Deserialize, Serialize};

use crate::data::{MachineState, PrintProgress, Protocol};

/// Root event enum for all emitted events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// Connection lifecycle events
    Connection(ConnectionEvent),
    /// Machine state and motion
    Machine(MachineEvent),
    /// Print job and file transfer progress
    Print(PrintEvent),
    /// Errors reported by the machine or the manager
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Print(_) => EventCategory::Print,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Print(e) => e.description(),
            AppEvent::Error(e) => e.description(),
        }
    }

    /// Event name as used by existing front-ends
    pub fn wire_name(&self) -> &'static str {
        match self {
            AppEvent::Connection(ConnectionEvent::Connecting { .. }) => "connection:connecting",
            AppEvent::Connection(ConnectionEvent::Connected { .. }) => "connection:connected",
            AppEvent::Connection(ConnectionEvent::Open { .. }) => "connection:open",
            AppEvent::Connection(ConnectionEvent::Close { .. }) => "connection:close",
            AppEvent::Machine(MachineEvent::State(_)) => "Marlin:state",
            AppEvent::Machine(MachineEvent::MoveStatus { .. }) => "move:status",
            AppEvent::Print(PrintEvent::Status(_)) => "sender:status",
            AppEvent::Print(PrintEvent::Started { .. }) => "sender:start",
            AppEvent::Print(PrintEvent::Finished { .. }) => "sender:end",
            AppEvent::Print(PrintEvent::Upload { .. }) => "connection:uploadProgress",
            AppEvent::Error(ErrorEvent::Manager { .. }) => "manager:error",
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Connection lifecycle events.
    Connection,
    /// Machine state and motion events.
    Machine,
    /// Print and transfer events.
    Print,
    /// Error events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Print => write!(f, "Print"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Reason a connection was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Caller requested disconnect
    UserRequested,
    /// Transport reported close or error
    ConnectionLost(String),
    /// No heartbeat arrived within the liveness window
    HeartbeatTimeout,
    /// Too many unparseable frames
    CorruptStream,
    /// Replaced by a new connection
    Superseded,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::CorruptStream => write!(f, "corrupt byte stream"),
            Self::Superseded => write!(f, "superseded by a new connection"),
        }
    }
}

/// Connection-related events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Starting connection attempt.
    Connecting {
        /// Address or device path being connected to.
        target: String,
    },
    /// Transport open and protocol identified.
    Open {
        /// Address or device path.
        target: String,
        /// Protocol in use.
        protocol: Protocol,
    },
    /// Machine prepared; carries the normalized state or the preparation error.
    Connected {
        /// State after preparation.
        state: Box<MachineState>,
        /// Error message if preparation failed.
        err: Option<String>,
    },
    /// Connection closed.
    Close {
        /// Address or device path.
        target: String,
        /// Why it closed.
        reason: DisconnectReason,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting { target } => format!("Connecting to {}", target),
            ConnectionEvent::Open { target, protocol } => {
                format!("Opened {} ({})", target, protocol)
            }
            ConnectionEvent::Connected { state, err } => match err {
                Some(err) => format!("Connected to {} with error: {}", state.series, err),
                None => format!("Connected to {} ({})", state.series, state.head_type),
            },
            ConnectionEvent::Close { target, reason } => {
                format!("Closed {}: {}", target, reason)
            }
        }
    }
}

/// Machine state events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineEvent {
    /// Periodic normalized state snapshot.
    State(Box<MachineState>),
    /// Motion started or finished.
    MoveStatus {
        /// A move command is executing.
        is_moving: bool,
        /// A homing command is executing.
        is_homing: bool,
    },
}

impl MachineEvent {
    fn description(&self) -> String {
        match self {
            MachineEvent::State(state) => {
                format!("State {} at {}", state.status, state.position)
            }
            MachineEvent::MoveStatus {
                is_moving,
                is_homing,
            } => format!("Moving: {}, homing: {}", is_moving, is_homing),
        }
    }
}

/// Print job events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrintEvent {
    /// Job started.
    Started {
        /// File being printed.
        filename: String,
    },
    /// Periodic progress.
    Status(PrintProgress),
    /// Job finished or stopped.
    Finished {
        /// File that was printed.
        filename: String,
    },
    /// File transfer progress.
    Upload {
        /// File being uploaded.
        filename: String,
        /// Fraction transferred in 0.0..=1.0.
        progress: f64,
        /// Machine is decompressing the upload.
        decompressing: bool,
    },
}

impl PrintEvent {
    fn description(&self) -> String {
        match self {
            PrintEvent::Started { filename } => format!("Print started: {}", filename),
            PrintEvent::Status(p) => format!(
                "Print {}: line {}/{}",
                p.filename, p.current_line, p.total_lines
            ),
            PrintEvent::Finished { filename } => format!("Print finished: {}", filename),
            PrintEvent::Upload {
                filename,
                progress,
                decompressing,
            } => {
                if *decompressing {
                    format!("Decompressing {}", filename)
                } else {
                    format!("Uploading {}: {:.0}%", filename, progress * 100.0)
                }
            }
        }
    }
}

/// Error events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// Error reported by the machine.
    Manager {
        /// Severity level.
        level: u8,
        /// Owning subsystem code.
        owner: u16,
        /// Error code.
        error_code: u16,
    },
}

impl ErrorEvent {
    fn description(&self) -> String {
        match self {
            ErrorEvent::Manager {
                level,
                owner,
                error_code,
            } => format!(
                "Machine error {} from owner {} (level {})",
                error_code, owner, level
            ),
        }
    }
}
