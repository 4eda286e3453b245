//! Protocol detection
//!
//! Network hosts are probed three ways at once: a TCP connect to the binary
//! protocol port, a machine-info round trip over UDP, and a TCP connect to
//! the screen's HTTP port. The strongest answer wins: TCP, then UDP, then
//! HTTP. Serial devices get a capability probe on a throwaway connection and
//! are classified from the first bytes they send back.

use crate::link::{Link, LinkEvent, LinkOpener, LinkWriter, SerialLinkOpener, UdpLinkOpener};
use crate::sacp::commands::system;
use crate::sacp::dispatcher::{Dispatcher, DispatcherConfig};
use crate::sacp::packet::{PeerId, MAGIC};
use fablink_core::{DetectionError, Protocol, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Written to a serial device before the probe to flush a partial line
pub const SERIAL_FLUSH: &[u8] = b"\r\n";
/// Capability probe understood by the text firmware
pub const SERIAL_PROBE: &[u8] = b"M1006\r\n";
/// Text the binary firmware uses to identify itself
pub const SACP_IDENTIFIER: &str = "SACP";

/// Ports and timeouts used while probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Binary protocol TCP port.
    pub sacp_tcp_port: u16,
    /// Binary protocol UDP port.
    pub sacp_udp_port: u16,
    /// Screen HTTP port.
    pub http_port: u16,
    /// Bound on each TCP connect probe.
    pub tcp_timeout: Duration,
    /// Bound on the UDP round trip.
    pub udp_timeout: Duration,
    /// Bound on waiting for the serial device to answer.
    pub serial_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sacp_tcp_port: 8888,
            sacp_udp_port: 8889,
            http_port: 8080,
            tcp_timeout: Duration::from_millis(1000),
            udp_timeout: Duration::from_millis(2000),
            serial_timeout: Duration::from_millis(2000),
        }
    }
}

/// Outcome of the three network probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkProbeResults {
    /// Binary protocol TCP port accepted a connection.
    pub sacp_tcp: bool,
    /// Binary protocol UDP port answered machine info.
    pub sacp_udp: bool,
    /// HTTP port accepted a connection.
    pub http: bool,
}

impl NetworkProbeResults {
    /// Pick the preferred protocol among the successful probes
    pub fn resolve(&self) -> Protocol {
        if self.sacp_tcp {
            Protocol::SacpOverTcp
        } else if self.sacp_udp {
            Protocol::SacpOverUdp
        } else if self.http {
            Protocol::Http
        } else {
            Protocol::Unknown
        }
    }
}

/// Classify what a serial device sent back so far
///
/// `None` means the bytes do not decide it yet.
pub fn classify_serial_response(received: &[u8]) -> Option<Protocol> {
    if received.len() >= MAGIC.len() && received[..MAGIC.len()] == MAGIC {
        return Some(Protocol::SacpOverSerial);
    }
    let text = String::from_utf8_lossy(received);
    if text.contains(SACP_IDENTIFIER) {
        Some(Protocol::SacpOverSerial)
    } else if text.contains("ok") {
        Some(Protocol::PlainText)
    } else {
        None
    }
}

/// Probe an already open link and shut it down afterwards
///
/// Silence until `timeout` counts as the binary protocol, since binary
/// firmware ignores the text probe.
pub async fn detect_on_link(link: Link, timeout: Duration) -> Result<Protocol> {
    let Link {
        writer,
        mut events,
        peer,
    } = link;

    let outcome = probe_link(writer.as_ref(), &mut events, &peer, timeout).await;
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Closing probe link {} failed: {}", peer, e);
    }
    outcome
}

async fn probe_link(
    writer: &dyn LinkWriter,
    events: &mut mpsc::Receiver<LinkEvent>,
    peer: &str,
    timeout: Duration,
) -> Result<Protocol> {
    writer.write_all(SERIAL_FLUSH).await?;
    writer.write_all(SERIAL_PROBE).await?;

    let mut received = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(LinkEvent::Data(bytes)) => {
                    received.extend_from_slice(&bytes);
                    if let Some(protocol) = classify_serial_response(&received) {
                        return Ok(protocol);
                    }
                }
                Some(LinkEvent::Closed(reason)) => {
                    return Err(DetectionError::ProbeFailed {
                        target: peer.to_string(),
                        reason: reason.unwrap_or_else(|| "device closed".to_string()),
                    }
                    .into());
                }
                None => {
                    return Err(DetectionError::ProbeFailed {
                        target: peer.to_string(),
                        reason: "reader stopped".to_string(),
                    }
                    .into());
                }
            },
            _ = &mut deadline => {
                tracing::debug!(
                    "No decisive answer from {} ({} bytes), assuming binary protocol",
                    peer,
                    received.len()
                );
                return Ok(Protocol::SacpOverSerial);
            }
        }
    }
}

/// Determines which protocol a machine speaks
#[derive(Debug, Clone, Default)]
pub struct ProtocolDetector {
    config: DetectorConfig,
}

impl ProtocolDetector {
    /// Create a detector
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Probe a network host
    pub async fn detect_network_protocol(&self, host: &str) -> Protocol {
        let results = self.probe_network(host).await;
        let protocol = results.resolve();
        tracing::info!("Detected {} on {} ({:?})", protocol, host, results);
        protocol
    }

    /// Run all three network probes concurrently
    pub async fn probe_network(&self, host: &str) -> NetworkProbeResults {
        let (sacp_tcp, sacp_udp, http) = tokio::join!(
            self.probe_tcp(host, self.config.sacp_tcp_port),
            self.probe_udp(host),
            self.probe_tcp(host, self.config.http_port),
        );
        NetworkProbeResults {
            sacp_tcp,
            sacp_udp,
            http,
        }
    }

    /// Whether `host:port` accepts a TCP connection in time
    pub async fn probe_tcp(&self, host: &str, port: u16) -> bool {
        let address = format!("{}:{}", host, port);
        match tokio::time::timeout(self.config.tcp_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!("TCP probe {} failed: {}", address, e);
                false
            }
            Err(_) => {
                tracing::debug!("TCP probe {} timed out", address);
                false
            }
        }
    }

    /// Whether the host answers a machine-info request over UDP in time
    pub async fn probe_udp(&self, host: &str) -> bool {
        let opener = UdpLinkOpener::new(host, self.config.sacp_udp_port);
        let link = match opener.open().await {
            Ok(link) => link,
            Err(e) => {
                tracing::debug!("UDP probe {} could not bind: {}", opener.describe(), e);
                return false;
            }
        };
        let dispatcher = Dispatcher::start(link, DispatcherConfig::default());
        let answered = dispatcher
            .send_with_timeout(
                system::MACHINE_INFO,
                PeerId::Controller,
                Vec::new(),
                Some(self.config.udp_timeout),
            )
            .await
            .is_ok();
        dispatcher.close().await;
        answered
    }

    /// Probe a serial device
    pub async fn detect_serial_port_protocol(&self, path: &str, baud_rate: u32) -> Result<Protocol> {
        self.detect_serial_with(&SerialLinkOpener::new(path, baud_rate))
            .await
    }

    /// Probe whatever `opener` connects to as a serial device
    pub async fn detect_serial_with(&self, opener: &dyn LinkOpener) -> Result<Protocol> {
        let target = opener.describe();
        let link = opener
            .open()
            .await
            .map_err(|e| DetectionError::ProbeFailed {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let protocol = detect_on_link(link, self.config.serial_timeout).await?;
        tracing::info!("Detected {} on {}", protocol, target);
        Ok(protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPeer;
    use crate::testing::FakeMarlin;

    #[test]
    fn test_priority_order() {
        let all = NetworkProbeResults {
            sacp_tcp: true,
            sacp_udp: true,
            http: true,
        };
        assert_eq!(all.resolve(), Protocol::SacpOverTcp);
        let no_tcp = NetworkProbeResults {
            sacp_tcp: false,
            ..all
        };
        assert_eq!(no_tcp.resolve(), Protocol::SacpOverUdp);
        let http_only = NetworkProbeResults {
            http: true,
            ..Default::default()
        };
        assert_eq!(http_only.resolve(), Protocol::Http);
        assert_eq!(NetworkProbeResults::default().resolve(), Protocol::Unknown);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify_serial_response(&[0xAA, 0x55, 0x10]),
            Some(Protocol::SacpOverSerial)
        );
        assert_eq!(
            classify_serial_response(b"echo: SACP mode\n"),
            Some(Protocol::SacpOverSerial)
        );
        assert_eq!(
            classify_serial_response(b"Machine Size: L\nok\n"),
            Some(Protocol::PlainText)
        );
        assert_eq!(classify_serial_response(b"Machine Si"), None);
        assert_eq!(classify_serial_response(&[0xAA]), None);
    }

    #[tokio::test]
    async fn test_text_firmware_is_plain_text() {
        let (link, marlin) = FakeMarlin::pair();
        let protocol = detect_on_link(link, Duration::from_millis(500)).await.unwrap();
        assert_eq!(protocol, Protocol::PlainText);
        assert_eq!(marlin.lines(), vec!["M1006".to_string()]);
    }

    #[tokio::test]
    async fn test_silent_device_defaults_to_binary() {
        let (link, peer) = MockPeer::pair("silent");
        let started = std::time::Instant::now();
        let protocol = detect_on_link(link, Duration::from_millis(100)).await.unwrap();
        assert_eq!(protocol, Protocol::SacpOverSerial);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(peer.is_shut_down());
    }

    #[tokio::test]
    async fn test_closed_device_fails_probe() {
        let (link, peer) = MockPeer::pair("unplugged");
        peer.close(Some("unplugged")).await;
        let err = detect_on_link(link, Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(
            err,
            fablink_core::Error::Detection(DetectionError::ProbeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_probe_hits_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let detector = ProtocolDetector::default();
        assert!(detector.probe_tcp("127.0.0.1", port).await);
        drop(listener);
        assert!(!detector.probe_tcp("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_network_detection_prefers_binary_tcp_over_http() {
        let sacp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let detector = ProtocolDetector::new(DetectorConfig {
            sacp_tcp_port: sacp.local_addr().unwrap().port(),
            sacp_udp_port: silent_udp.local_addr().unwrap().port(),
            http_port: http.local_addr().unwrap().port(),
            tcp_timeout: Duration::from_millis(500),
            udp_timeout: Duration::from_millis(150),
            ..Default::default()
        });

        let results = detector.probe_network("127.0.0.1").await;
        assert!(results.sacp_tcp);
        assert!(!results.sacp_udp);
        assert!(results.http);
        assert_eq!(
            detector.detect_network_protocol("127.0.0.1").await,
            Protocol::SacpOverTcp
        );

        drop(sacp);
        assert_eq!(
            detector.detect_network_protocol("127.0.0.1").await,
            Protocol::Http
        );

        drop(http);
        assert_eq!(
            detector.detect_network_protocol("127.0.0.1").await,
            Protocol::Unknown
        );
    }
}
