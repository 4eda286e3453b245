//! UDP links
//!
//! The socket is bound to an ephemeral local port and connected to the
//! machine, so every datagram goes to one peer and only that peer's
//! datagrams are delivered. UDP never reports a close on its own; liveness
//! is left to the heartbeat watchdog.

use super::{Link, LinkEvent, LinkOpener, LinkWriter, LINK_EVENT_CAPACITY};
use async_trait::async_trait;
use fablink_core::{ConnectionError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest datagram we expect from a machine
const MAX_DATAGRAM: usize = 65_535;

/// Opens UDP links to a host and port
#[derive(Debug, Clone)]
pub struct UdpLinkOpener {
    host: String,
    port: u16,
}

impl UdpLinkOpener {
    /// Create an opener for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl LinkOpener for UdpLinkOpener {
    async fn open(&self) -> Result<Link> {
        let target = format!("{}:{}", self.host, self.port);
        let failed = |e: std::io::Error| ConnectionError::FailedToOpen {
            target: target.clone(),
            reason: e.to_string(),
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(failed)?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .map_err(failed)?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let reader = tokio::spawn(read_loop(target.clone(), socket.clone(), tx));

        tracing::info!("UDP socket connected to {}", target);
        let writer = UdpWriter {
            socket,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        };
        Ok(Link::new(Arc::new(writer), rx, self.describe()))
    }

    fn describe(&self) -> String {
        format!("udp://{}:{}", self.host, self.port)
    }
}

async fn read_loop(target: String, socket: Arc<UdpSocket>, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if tx.send(LinkEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            // An ICMP "port unreachable" surfaces here on a connected socket.
            // It only says one datagram was lost; keep listening.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!("{} refused a datagram", target);
            }
            Err(e) => {
                tracing::error!("UDP receive from {} failed: {}", target, e);
                let _ = tx.send(LinkEvent::Closed(Some(e.to_string()))).await;
                break;
            }
        }
    }
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl LinkWriter for UdpWriter {
    async fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::closed("socket shut down").into());
        }
        match self.socket.send(data).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::debug!("Datagram refused by peer");
                Ok(())
            }
            Err(e) => Err(ConnectionError::IoError {
                reason: e.to_string(),
            }
            .into()),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_link_exchanges_datagrams() {
        let machine = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = machine.local_addr().unwrap().port();

        let opener = UdpLinkOpener::new("127.0.0.1", port);
        let mut link = opener.open().await.unwrap();
        link.writer.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = machine.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        machine.send_to(b"pong", from).await.unwrap();

        assert_eq!(
            link.events.recv().await,
            Some(LinkEvent::Data(b"pong".to_vec()))
        );

        link.writer.shutdown().await.unwrap();
        assert!(link.writer.write_all(b"late").await.is_err());
    }
}
