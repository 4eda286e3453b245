//! TCP links

use super::{Link, LinkEvent, LinkOpener, LinkWriter, LINK_EVENT_CAPACITY};
use async_trait::async_trait;
use fablink_core::{ConnectionError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Opens TCP links to a host and port
#[derive(Debug, Clone)]
pub struct TcpLinkOpener {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpLinkOpener {
    /// Create an opener with the given connect timeout
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl LinkOpener for TcpLinkOpener {
    async fn open(&self) -> Result<Link> {
        let target = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ConnectionError::ConnectionTimeout {
            timeout_ms: self.connect_timeout.as_millis() as u64,
        })?
        .map_err(|e| ConnectionError::FailedToOpen {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on {}: {}", target, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        tokio::spawn(read_loop(target.clone(), read_half, tx));

        tracing::info!("Connected to {}", target);
        let writer = TcpWriter {
            half: Mutex::new(Some(write_half)),
        };
        Ok(Link::new(Arc::new(writer), rx, self.describe()))
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

async fn read_loop(target: String, mut half: OwnedReadHalf, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match half.read(&mut buf).await {
            Ok(0) => {
                tracing::info!("{} closed by peer", target);
                let _ = tx.send(LinkEvent::Closed(None)).await;
                break;
            }
            Ok(n) => {
                if tx.send(LinkEvent::Data(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Read from {} failed: {}", target, e);
                let _ = tx.send(LinkEvent::Closed(Some(e.to_string()))).await;
                break;
            }
        }
    }
}

struct TcpWriter {
    half: Mutex<Option<OwnedWriteHalf>>,
}

#[async_trait]
impl LinkWriter for TcpWriter {
    async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.half.lock().await;
        let half = guard
            .as_mut()
            .ok_or_else(|| ConnectionError::closed("socket shut down"))?;
        half.write_all(data).await.map_err(|e| {
            ConnectionError::IoError {
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut half) = self.half.lock().await.take() {
            // The peer sees EOF and our reader gets its close from the socket.
            let _ = half.shutdown().await;
        }
        Ok(())
    }
}
