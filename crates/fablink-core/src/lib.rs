//! # FabLink Core
//!
//! Core types, errors, and events shared by the FabLink crates.
//! Provides the protocol and machine data model, the error taxonomy,
//! and the normalized event bus the connection manager publishes to.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{
    AirPurifierState, Axis, BedZoneState, EnclosureState, ExtruderState, GcodeMetadata, HeadType,
    MachineSeries, MachineState, ModuleInfo, ModuleKind, ModuleTable, Position, PrintJob,
    PrintProgress, Protocol, WorkflowStatus,
};

pub use error::{
    ChannelError, ConnectionError, DetectionError, Error, ProtocolError, Result, TransferError,
};

pub use event_bus::{
    AppEvent, ConnectionEvent, DisconnectReason, ErrorEvent, EventBus, EventBusConfig,
    EventCategory, EventFilter, MachineEvent, PrintEvent, SubscriptionId,
};
