//! Binary machine protocol
//!
//! Layers, leaves first: payload buffers, frame codec, command tags,
//! typed telemetry, the dispatcher, pull-driven file transfer, and the
//! typed client.

pub mod buffer;
pub mod client;
pub mod commands;
pub mod dispatcher;
pub mod packet;
pub mod telemetry;
pub mod transfer;

pub use client::{HandshakeInfo, SacpClient};
pub use dispatcher::{check_result, CloseCause, Dispatcher, DispatcherConfig, SubscriptionId};
pub use packet::{Attribute, CommandTag, FrameDecoder, Packet, PeerId};
pub use telemetry::Telemetry;
pub use transfer::{FileTransfer, TransferMode, TransferProgress};
