//! Configuration file management for elegoo-connect.
//!
//! Loads and saves the list of configured devices from
//! `~/.config/elegoo-connect/config.toml` (§4.8, §6.6), the same
//! `dirs` + `toml` + `serde` + `anyhow::Context` shape the teacher's
//! `config.rs` uses for its single-printer `~/.config/bambutop/config.toml`,
//! extended here to a list keyed by serial plus a shared defaults block.

use crate::identity::ConnectionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COORDINATOR_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_DEGRADED_GRACE_SECS: u64 = 20;
pub const DEFAULT_PROXY_PORT_BASE: u16 = 3030;

/// The full contents of the on-disk config file: every configured device
/// plus the defaults new devices and the coordinator fall back to.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConnectFileConfig {
    #[serde(default)]
    pub devices: Vec<ConnectionConfig>,
    #[serde(default)]
    pub defaults: GlobalDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub coordinator_poll_interval_secs: u64,
    pub degraded_grace_secs: u64,
    pub proxy_port_base: u16,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            coordinator_poll_interval_secs: DEFAULT_COORDINATOR_POLL_INTERVAL_SECS,
            degraded_grace_secs: DEFAULT_DEGRADED_GRACE_SECS,
            proxy_port_base: DEFAULT_PROXY_PORT_BASE,
        }
    }
}

impl GlobalDefaults {
    pub fn coordinator_poll_interval(&self) -> Duration {
        Duration::from_secs(self.coordinator_poll_interval_secs)
    }

    pub fn degraded_grace(&self) -> Duration {
        Duration::from_secs(self.degraded_grace_secs)
    }
}

impl ConnectFileConfig {
    /// Returns `Ok(None)` rather than an error when no config file exists
    /// yet, so callers can fall through to the first-time setup flow.
    pub fn load() -> Result<Option<Self>> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {path:?}"))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(Some(config))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {parent:?}"))?;
        }

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("failed to write config file: {path:?}"))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// The config file is stored at `~/.config/elegoo-connect/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join(".config").join("elegoo-connect").join("config.toml"))
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<&ConnectionConfig> {
        self.devices.iter().find(|d| d.identity.serial == serial)
    }

    /// Replaces a device's config if its serial already exists, else appends.
    pub fn upsert_device(&mut self, device: ConnectionConfig) {
        match self
            .devices
            .iter_mut()
            .find(|d| d.identity.serial == device.identity.serial)
        {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, PrinterFamily, ProtocolKind};

    fn sample_device(serial: &str) -> ConnectionConfig {
        ConnectionConfig {
            identity: Identity {
                name: "printer".into(),
                model: "Saturn 4 Ultra".into(),
                serial: serial.into(),
                ip_address: "192.168.1.50".parse().unwrap(),
                firmware: "1.0".into(),
                protocol_version: "1".into(),
                protocol_kind: ProtocolKind::WebsocketSdcp,
                printer_family: PrinterFamily::Resin,
                capabilities: Default::default(),
                legacy_broker_port: None,
            },
            proxy_enabled: false,
            proxy_ws_port: 3030,
            proxy_video_port: 3031,
            access_code: None,
        }
    }

    #[test]
    fn upsert_replaces_existing_serial() {
        let mut config = ConnectFileConfig::default();
        config.upsert_device(sample_device("ABC"));
        config.upsert_device(sample_device("ABC"));
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn upsert_appends_new_serial() {
        let mut config = ConnectFileConfig::default();
        config.upsert_device(sample_device("ABC"));
        config.upsert_device(sample_device("DEF"));
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn defaults_match_spec_timings() {
        let defaults = GlobalDefaults::default();
        assert_eq!(defaults.coordinator_poll_interval(), Duration::from_secs(2));
        assert_eq!(defaults.degraded_grace(), Duration::from_secs(20));
    }
}
