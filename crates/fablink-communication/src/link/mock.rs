//! In-memory links for tests and simulations

use super::{Link, LinkEvent, LinkOpener, LinkWriter, LINK_EVENT_CAPACITY};
use async_trait::async_trait;
use fablink_core::{ConnectionError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The far end of an in-memory link
///
/// Everything the host writes shows up in [`MockPeer::recv_written`];
/// everything pushed with [`MockPeer::push`] shows up on the host's link.
pub struct MockPeer {
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    inject: mpsc::Sender<LinkEvent>,
    state: Arc<MockWriterState>,
}

#[derive(Default)]
struct MockWriterState {
    closed: AtomicBool,
    shutdowns: AtomicUsize,
}

impl MockPeer {
    /// Create a connected link and its peer
    pub fn pair(peer_name: impl Into<String>) -> (Link, MockPeer) {
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let state = Arc::new(MockWriterState::default());
        let writer = MockWriter {
            written: written_tx,
            state: state.clone(),
        };
        let link = Link::new(Arc::new(writer), inject_rx, peer_name);
        let peer = MockPeer {
            written: written_rx,
            inject: inject_tx,
            state,
        };
        (link, peer)
    }

    /// Next chunk written by the host, or `None` once the host side is gone
    pub async fn recv_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Chunks written so far without waiting
    pub fn drain_written(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.written.try_recv() {
            out.extend(chunk);
        }
        out
    }

    /// Deliver bytes to the host
    pub async fn push(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.inject.send(LinkEvent::Data(bytes.into())).await.is_ok()
    }

    /// Simulate the transport closing
    pub async fn close(&self, reason: Option<&str>) -> bool {
        self.inject
            .send(LinkEvent::Closed(reason.map(str::to_string)))
            .await
            .is_ok()
    }

    /// Handle that can inject bytes from another task
    pub fn injector(&self) -> mpsc::Sender<LinkEvent> {
        self.inject.clone()
    }

    /// Whether the host shut its writer down
    pub fn is_shut_down(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// How many times the host called shutdown
    pub fn shutdown_count(&self) -> usize {
        self.state.shutdowns.load(Ordering::Acquire)
    }
}

struct MockWriter {
    written: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<MockWriterState>,
}

#[async_trait]
impl LinkWriter for MockWriter {
    async fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::closed("mock link shut down").into());
        }
        self.written
            .send(data.to_vec())
            .map_err(|_| ConnectionError::closed("mock peer dropped").into())
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::Release);
        self.state.shutdowns.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Opener that hands out prepared links in order
///
/// Opening with nothing queued fails like an unreachable device.
#[derive(Default)]
pub struct MockLinkOpener {
    links: Mutex<VecDeque<Link>>,
    opened: AtomicUsize,
    name: String,
}

impl MockLinkOpener {
    /// Create an opener with no links queued
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Queue a fresh link and return its peer
    pub fn queue_pair(&self) -> MockPeer {
        let (link, peer) = MockPeer::pair(self.name.clone());
        self.links.lock().push_back(link);
        peer
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LinkOpener for MockLinkOpener {
    async fn open(&self) -> Result<Link> {
        let link = self.links.lock().pop_front().ok_or_else(|| {
            ConnectionError::FailedToOpen {
                target: self.name.clone(),
                reason: "no mock link queued".to_string(),
            }
        })?;
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(link)
    }

    fn describe(&self) -> String {
        format!("mock://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_moves_bytes_both_ways() {
        let (mut link, mut peer) = MockPeer::pair("bench");
        link.writer.write_all(b"G28\n").await.unwrap();
        assert_eq!(peer.recv_written().await.unwrap(), b"G28\n");

        assert!(peer.push(b"ok\n".to_vec()).await);
        assert_eq!(
            link.events.recv().await,
            Some(LinkEvent::Data(b"ok\n".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_opener_hands_out_queued_links_once() {
        let opener = MockLinkOpener::new("bench");
        let _peer = opener.queue_pair();
        assert!(opener.open().await.is_ok());
        assert!(opener.open().await.is_err());
        assert_eq!(opener.open_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_counted() {
        let (link, peer) = MockPeer::pair("bench");
        link.writer.shutdown().await.unwrap();
        link.writer.shutdown().await.unwrap();
        assert!(peer.is_shut_down());
        assert_eq!(peer.shutdown_count(), 2);
        assert!(link.writer.write_all(b"x").await.is_err());
    }
}
