//! Settings Persistence
//!
//! Ties a [`Config`] to the file it came from so the last successful
//! connection can be written back without the caller tracking paths.

use crate::config::Config;
use crate::error::SettingsResult;
use fablink_communication::TransportTarget;
use fablink_core::Protocol;
use std::path::{Path, PathBuf};

/// A config and the file backing it
#[derive(Debug, Clone)]
pub struct SettingsPersistence {
    config: Config,
    path: PathBuf,
}

impl SettingsPersistence {
    /// Load `path`, or start from defaults when the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> SettingsResult<Self> {
        let path = path.into();
        let config = if path.exists() {
            Config::load_from_file(&path)?
        } else {
            Config::default()
        };
        Ok(Self { config, path })
    }

    /// Open the platform default location
    pub fn open_default() -> SettingsResult<Self> {
        Self::open(Config::default_path()?)
    }

    /// Write the config back to its file
    pub fn save(&self) -> SettingsResult<()> {
        self.config.save_to_file(&self.path)
    }

    /// Remember a connection that reached the connected state
    ///
    /// The protocol becomes the hint for the next session so detection can
    /// be skipped; `Unknown` clears it.
    pub fn remember_connection(
        &mut self,
        target: &TransportTarget,
        protocol: Protocol,
    ) -> SettingsResult<()> {
        self.config.set_target(target);
        self.config.connection.protocol_hint =
            (protocol != Protocol::Unknown).then_some(protocol);
        self.save()
    }

    /// Forget the protocol hint, forcing detection next time
    pub fn forget_protocol(&mut self) -> SettingsResult<()> {
        self.config.connection.protocol_hint = None;
        self.save()
    }

    /// Get reference to config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable reference to config
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// File backing this config
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsPersistence::open(dir.path().join("config.toml")).unwrap();
        assert_eq!(store.config(), &Config::default());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_remember_connection_persists_hint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = SettingsPersistence::open(&path).unwrap();

        store
            .remember_connection(
                &TransportTarget::serial("/dev/ttyACM0", 115200),
                Protocol::SacpOverSerial,
            )
            .unwrap();

        let reopened = SettingsPersistence::open(&path).unwrap();
        assert_eq!(
            reopened.config().target(),
            Some(TransportTarget::serial("/dev/ttyACM0", 115200))
        );
        assert_eq!(
            reopened.config().connection.protocol_hint,
            Some(Protocol::SacpOverSerial)
        );
    }

    #[test]
    fn test_forget_protocol() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut store = SettingsPersistence::open(&path).unwrap();
        store
            .remember_connection(&TransportTarget::network("10.0.0.5"), Protocol::Http)
            .unwrap();
        store.forget_protocol().unwrap();

        let reopened = SettingsPersistence::open(&path).unwrap();
        assert_eq!(reopened.config().connection.protocol_hint, None);
        assert_eq!(
            reopened.config().target(),
            Some(TransportTarget::network("10.0.0.5"))
        );
    }
}
