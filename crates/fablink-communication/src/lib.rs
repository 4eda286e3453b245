//! # FabLink Communication
//!
//! Connection core for FabLink machines: byte links over serial, TCP, UDP,
//! and in-memory mocks; the binary protocol's frame codec, dispatcher, and
//! file transfer; protocol detection; the five channels; machine instances;
//! and the connection manager that ties them into one normalized event
//! stream.

pub mod channel;
pub mod detector;
pub mod link;
pub mod machine;
pub mod manager;
pub mod sacp;
pub mod testing;
pub mod text;
pub mod watch;

pub use channel::{
    Channel, ChannelEvent, ChannelLifecycle, HttpChannel, HttpChannelConfig, LegacySample,
    LegacyTelemetry, PrintRequest, ReadyInfo, SacpChannel, SacpChannelConfig, SacpTransport,
    TextSerialChannel,
};
pub use detector::{DetectorConfig, ProtocolDetector};
pub use link::{
    list_ports, Link, LinkOpener, SerialLinkOpener, SerialPortInfo, TcpLinkOpener, UdpLinkOpener,
};
pub use machine::{LegacyInstance, MachineInstance, SacpInstance, StateTracker};
pub use manager::{
    ChannelFactory, ConnectionManager, DefaultChannelFactory, HttpSettings, MachineCommand,
    ManagerConfig, TransportTarget,
};
pub use sacp::{Dispatcher, DispatcherConfig, HandshakeInfo, SacpClient, TransferMode};
pub use text::{TextController, TextControllerConfig};
pub use watch::{ConnectionWatchConfig, ConnectionWatcher};
