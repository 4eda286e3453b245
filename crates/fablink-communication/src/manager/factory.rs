//! Protocol detection and channel construction
//!
//! The manager never builds transports itself; it asks a [`ChannelFactory`]
//! which protocol a target speaks and for a fresh channel speaking it.

use crate::channel::{
    Channel, ChannelEventSender, HttpChannel, HttpChannelConfig, SacpChannel, SacpChannelConfig,
    SacpTransport, TextSerialChannel,
};
use crate::detector::{DetectorConfig, ProtocolDetector};
use crate::link::{LinkOpener, SerialLinkOpener, TcpLinkOpener, UdpLinkOpener};
use crate::text::TextControllerConfig;
use crate::watch::ConnectionWatchConfig;
use async_trait::async_trait;
use fablink_core::{ChannelError, DetectionError, Protocol, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where the machine is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    /// Serial device.
    Serial {
        /// Device path.
        path: String,
        /// Line speed.
        baud_rate: u32,
    },
    /// Network host.
    Network {
        /// Address or host name.
        host: String,
    },
}

impl TransportTarget {
    /// Serial device at `path`
    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::Serial {
            path: path.into(),
            baud_rate,
        }
    }

    /// Network host
    pub fn network(host: impl Into<String>) -> Self {
        Self::Network { host: host.into() }
    }

    /// Whether `protocol` can run over this target
    pub fn carries(&self, protocol: Protocol) -> bool {
        match self {
            Self::Serial { .. } => protocol.is_serial(),
            Self::Network { .. } => protocol.is_network(),
        }
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { path, baud_rate } => write!(f, "{}@{}", path, baud_rate),
            Self::Network { host } => write!(f, "{}", host),
        }
    }
}

/// Detects protocols and builds channels
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Which protocol the target speaks
    async fn detect(&self, target: &TransportTarget) -> Result<Protocol>;

    /// A closed channel for `protocol` reporting to `events`
    fn create(
        &self,
        protocol: Protocol,
        target: &TransportTarget,
        events: ChannelEventSender,
    ) -> Result<Channel>;
}

/// Settings of the HTTP channel beyond its address
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Token of an earlier session.
    pub token: Option<String>,
    /// Status poll period.
    pub poll_interval: Duration,
    /// Bound on every request.
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            token: None,
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything needed to reach and run a machine
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Probe ports and timeouts; the ports are reused to open channels.
    pub detector: DetectorConfig,
    /// Binary-protocol session settings.
    pub sacp: SacpChannelConfig,
    /// HTTP session settings.
    pub http: HttpSettings,
    /// Text controller settings.
    pub text: TextControllerConfig,
    /// Bound on waiting for `Ready` after the transport opened.
    pub ready_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            sacp: SacpChannelConfig::default(),
            http: HttpSettings::default(),
            text: TextControllerConfig::default(),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Real transports: serial ports, sockets, and HTTP
#[derive(Debug, Clone, Default)]
pub struct DefaultChannelFactory {
    config: ManagerConfig,
    detector: ProtocolDetector,
}

impl DefaultChannelFactory {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            detector: ProtocolDetector::new(config.detector.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn sacp(
        &self,
        transport: SacpTransport,
        opener: Arc<dyn LinkOpener>,
        events: ChannelEventSender,
    ) -> Channel {
        Channel::sacp(SacpChannel::new(
            transport,
            opener,
            self.config.sacp.clone(),
            events,
        ))
    }

    fn http_config(&self, host: &str) -> HttpChannelConfig {
        HttpChannelConfig {
            host: host.to_string(),
            port: self.config.detector.http_port,
            token: self.config.http.token.clone(),
            poll_interval: self.config.http.poll_interval,
            request_timeout: self.config.http.request_timeout,
            watch: ConnectionWatchConfig {
                timeout_ms: self.config.sacp.watch.timeout_ms,
                ..ConnectionWatchConfig::default()
            },
        }
    }
}

#[async_trait]
impl ChannelFactory for DefaultChannelFactory {
    async fn detect(&self, target: &TransportTarget) -> Result<Protocol> {
        match target {
            TransportTarget::Serial { path, baud_rate } => {
                self.detector
                    .detect_serial_port_protocol(path, *baud_rate)
                    .await
            }
            TransportTarget::Network { host } => {
                Ok(self.detector.detect_network_protocol(host).await)
            }
        }
    }

    fn create(
        &self,
        protocol: Protocol,
        target: &TransportTarget,
        events: ChannelEventSender,
    ) -> Result<Channel> {
        let detector = &self.config.detector;
        let channel = match (protocol, target) {
            (Protocol::PlainText, TransportTarget::Serial { path, baud_rate }) => {
                Channel::TextSerial(Arc::new(TextSerialChannel::new(
                    Arc::new(SerialLinkOpener::new(path, *baud_rate)),
                    self.config.text,
                    events,
                )))
            }
            (Protocol::SacpOverSerial, TransportTarget::Serial { path, baud_rate }) => self.sacp(
                SacpTransport::Serial,
                Arc::new(SerialLinkOpener::new(path, *baud_rate)),
                events,
            ),
            (Protocol::SacpOverTcp, TransportTarget::Network { host }) => self.sacp(
                SacpTransport::Tcp,
                Arc::new(TcpLinkOpener::new(
                    host,
                    detector.sacp_tcp_port,
                    detector.tcp_timeout,
                )),
                events,
            ),
            (Protocol::SacpOverUdp, TransportTarget::Network { host }) => self.sacp(
                SacpTransport::Udp,
                Arc::new(UdpLinkOpener::new(host, detector.sacp_udp_port)),
                events,
            ),
            (Protocol::Http, TransportTarget::Network { host }) => {
                Channel::Http(Arc::new(HttpChannel::new(self.http_config(host), events)?))
            }
            (Protocol::Unknown, _) => {
                return Err(DetectionError::UnknownMachine {
                    target: target.to_string(),
                }
                .into())
            }
            (protocol, target) => {
                return Err(ChannelError::InvalidArgument {
                    reason: format!("{} cannot run over {}", protocol, target),
                }
                .into())
            }
        };
        Ok(channel)
    }
}
