//! Configuration and settings management for FabLink
//!
//! Provides configuration file handling, validation, and conversion into the
//! runtime configs of the communication crate. Supports JSON and TOML files
//! stored in the platform configuration directory.
//!
//! Configuration is organized into logical sections:
//! - Connection (last target, baud rate, protocol hint, handshake identity)
//! - Detection (probe ports and timeouts)
//! - Heartbeat (watchdog and poll intervals)
//! - Dispatcher (request timeout, corrupt frame threshold)

use crate::error::{SettingsError, SettingsResult};
use fablink_communication::{
    ConnectionWatchConfig, DetectorConfig, DispatcherConfig, HandshakeInfo, HttpSettings,
    ManagerConfig, SacpChannelConfig, TransportTarget,
};
use fablink_core::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config directory
pub const CONFIG_DIR_NAME: &str = "fablink";

/// File name of the default configuration
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Kind of transport the last connection used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Serial/USB device
    #[default]
    Serial,
    /// TCP/UDP/HTTP host
    Network,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Last used transport
    pub transport: TransportKind,
    /// Device path (serial) or host name (network); empty when never connected
    pub address: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Protocol to assume instead of probing
    pub protocol_hint: Option<Protocol>,
    /// Name shown on the machine screen
    pub client_name: String,
    /// Token from an earlier session with the machine
    pub token: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            address: String::new(),
            baud_rate: 115200,
            protocol_hint: None,
            client_name: HandshakeInfo::default().client_name,
            token: None,
        }
    }
}

/// Protocol detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Binary protocol TCP port
    pub sacp_tcp_port: u16,
    /// Binary protocol UDP port
    pub sacp_udp_port: u16,
    /// Screen HTTP port
    pub http_port: u16,
    /// TCP connect probe timeout in milliseconds
    pub tcp_timeout_ms: u64,
    /// UDP round trip timeout in milliseconds
    pub udp_timeout_ms: u64,
    /// Serial answer timeout in milliseconds
    pub serial_timeout_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            sacp_tcp_port: 8888,
            sacp_udp_port: 8889,
            http_port: 8080,
            tcp_timeout_ms: 1000,
            udp_timeout_ms: 2000,
            serial_timeout_ms: 2000,
        }
    }
}

/// Liveness settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Silence after which the connection is declared dead
    pub timeout_ms: u64,
    /// Heartbeat push interval requested from the machine
    pub interval_ms: u16,
    /// HTTP status poll interval
    pub poll_interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            interval_ms: 1000,
            poll_interval_ms: 1000,
        }
    }
}

/// Request dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Safety timeout per request in milliseconds; 0 disables it
    pub request_timeout_ms: u64,
    /// Consecutive corrupt frames that close the stream; 0 never closes
    pub corruption_threshold: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            corruption_threshold: 32,
        }
    }
}

/// Supported file formats, chosen by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> SettingsResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            other => Err(SettingsError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
/// Sections missing from a file keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Detection settings
    pub detection: DetectionSettings,
    /// Heartbeat settings
    pub heartbeat: HeartbeatSettings,
    /// Dispatcher settings
    pub dispatcher: DispatcherSettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform location of the configuration file
    pub fn default_path() -> SettingsResult<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            SettingsError::ConfigDirectory("no configuration directory on this platform".into())
        })?;
        Ok(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::LoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str(&content)?,
            ConfigFormat::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML), creating the parent directory
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        let format = ConfigFormat::from_path(path)?;

        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SettingsError::ConfigDirectory(format!("{}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, content).map_err(|e| SettingsError::SaveError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        let connection = &self.connection;
        if connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if connection.client_name.trim().is_empty() {
            return Err(SettingsError::invalid(
                "connection.client_name",
                "must not be empty",
            ));
        }
        if let Some(hint) = connection.protocol_hint {
            let carried = match connection.transport {
                TransportKind::Serial => hint.is_serial(),
                TransportKind::Network => hint.is_network(),
            };
            if hint != Protocol::Unknown && !carried {
                return Err(SettingsError::invalid(
                    "connection.protocol_hint",
                    format!("{} cannot run over a {} transport", hint, connection.transport),
                ));
            }
        }

        let detection = &self.detection;
        for (key, port) in [
            ("detection.sacp_tcp_port", detection.sacp_tcp_port),
            ("detection.sacp_udp_port", detection.sacp_udp_port),
            ("detection.http_port", detection.http_port),
        ] {
            if port == 0 {
                return Err(SettingsError::invalid(key, "must be > 0"));
            }
        }
        for (key, timeout) in [
            ("detection.tcp_timeout_ms", detection.tcp_timeout_ms),
            ("detection.udp_timeout_ms", detection.udp_timeout_ms),
            ("detection.serial_timeout_ms", detection.serial_timeout_ms),
            ("heartbeat.timeout_ms", self.heartbeat.timeout_ms),
            ("heartbeat.poll_interval_ms", self.heartbeat.poll_interval_ms),
        ] {
            if timeout == 0 {
                return Err(SettingsError::invalid(key, "must be > 0"));
            }
        }

        if self.heartbeat.interval_ms == 0 {
            return Err(SettingsError::invalid("heartbeat.interval_ms", "must be > 0"));
        }
        if self.heartbeat.timeout_ms <= u64::from(self.heartbeat.interval_ms) {
            return Err(SettingsError::invalid(
                "heartbeat.timeout_ms",
                "must be longer than heartbeat.interval_ms",
            ));
        }

        Ok(())
    }

    /// The last used connection target, if one was recorded
    pub fn target(&self) -> Option<TransportTarget> {
        let address = self.connection.address.trim();
        if address.is_empty() {
            return None;
        }
        Some(match self.connection.transport {
            TransportKind::Serial => TransportTarget::serial(address, self.connection.baud_rate),
            TransportKind::Network => TransportTarget::network(address),
        })
    }

    /// Record `target` as the last used connection
    pub fn set_target(&mut self, target: &TransportTarget) {
        match target {
            TransportTarget::Serial { path, baud_rate } => {
                self.connection.transport = TransportKind::Serial;
                self.connection.address = path.clone();
                self.connection.baud_rate = *baud_rate;
            }
            TransportTarget::Network { host } => {
                self.connection.transport = TransportKind::Network;
                self.connection.address = host.clone();
            }
        }
    }

    /// Probe settings for protocol detection
    pub fn detector_config(&self) -> DetectorConfig {
        let d = &self.detection;
        DetectorConfig {
            sacp_tcp_port: d.sacp_tcp_port,
            sacp_udp_port: d.sacp_udp_port,
            http_port: d.http_port,
            tcp_timeout: Duration::from_millis(d.tcp_timeout_ms),
            udp_timeout: Duration::from_millis(d.udp_timeout_ms),
            serial_timeout: Duration::from_millis(d.serial_timeout_ms),
        }
    }

    /// Request dispatcher settings
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let timeout = self.dispatcher.request_timeout_ms;
        DispatcherConfig {
            request_timeout: (timeout > 0).then(|| Duration::from_millis(timeout)),
            corruption_threshold: self.dispatcher.corruption_threshold,
            ..DispatcherConfig::default()
        }
    }

    /// Heartbeat watchdog settings
    pub fn watch_config(&self) -> ConnectionWatchConfig {
        ConnectionWatchConfig {
            timeout_ms: self.heartbeat.timeout_ms,
            ..ConnectionWatchConfig::default()
        }
    }

    /// Binary protocol session settings
    pub fn sacp_config(&self) -> SacpChannelConfig {
        SacpChannelConfig {
            dispatcher: self.dispatcher_config(),
            watch: self.watch_config(),
            heartbeat_interval_ms: self.heartbeat.interval_ms,
            handshake: HandshakeInfo {
                client_name: self.connection.client_name.clone(),
                token: self.connection.token.clone().unwrap_or_default(),
                ..HandshakeInfo::default()
            },
            ..SacpChannelConfig::default()
        }
    }

    /// Everything the connection manager needs
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            detector: self.detector_config(),
            sacp: self.sacp_config(),
            http: HttpSettings {
                token: self.connection.token.clone(),
                poll_interval: Duration::from_millis(self.heartbeat.poll_interval_ms),
                request_timeout: self
                    .dispatcher_config()
                    .request_timeout
                    .unwrap_or(HttpSettings::default().request_timeout),
            },
            ..ManagerConfig::default()
        }
    }
}
