//! Byte links
//!
//! A link is a duplex byte pipe to a machine: a shared writer half and a
//! stream of [`LinkEvent`]s produced by a reader task. Serial ports, TCP
//! sockets, connected UDP sockets, and in-memory mocks all look the same
//! from the dispatcher, the text controller, and the protocol detector.

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use fablink_core::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use mock::{MockLinkOpener, MockPeer};
pub use serial::{list_ports, SerialLinkOpener, SerialPortInfo};
pub use tcp::TcpLinkOpener;
pub use udp::UdpLinkOpener;

/// Capacity of the reader-to-consumer event queue
pub const LINK_EVENT_CAPACITY: usize = 256;

/// Event produced by a link's reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Bytes arrived; boundaries carry no meaning.
    Data(Vec<u8>),
    /// The transport closed, with the error text if it failed.
    Closed(Option<String>),
}

/// Writer half of a link
#[async_trait]
pub trait LinkWriter: Send + Sync {
    /// Write all bytes to the transport
    async fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Close the transport and stop its reader. Calling it twice is harmless.
    async fn shutdown(&self) -> Result<()>;
}

/// An open link
pub struct Link {
    /// Shared writer half.
    pub writer: Arc<dyn LinkWriter>,
    /// Inbound bytes and the final close notification.
    pub events: mpsc::Receiver<LinkEvent>,
    /// Human readable peer description, e.g. `tcp://192.168.1.20:8888`.
    pub peer: String,
}

impl Link {
    /// Assemble a link from its halves
    pub fn new(
        writer: Arc<dyn LinkWriter>,
        events: mpsc::Receiver<LinkEvent>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            writer,
            events,
            peer: peer.into(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

/// Something that can open a fresh link to a fixed target
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open a new link
    async fn open(&self) -> Result<Link>;

    /// Target description used in logs and events
    fn describe(&self) -> String;
}
