//! FabLink Settings Crate
//!
//! Handles application configuration, its persistence, and the mapping onto
//! the connection manager's runtime settings.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    Config, ConnectionSettings, DetectionSettings, DispatcherSettings, HeartbeatSettings,
    TransportKind,
};
pub use error::{SettingsError, SettingsResult};
pub use persistence::SettingsPersistence;
