//! Bridge configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::ManagerTuning;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Stable path the consumer opens; a symlink to the real pty slave.
    /// `None` advertises the raw `/dev/pts/N` path instead.
    #[serde(default = "BridgeSettings::default_link_path")]
    pub link_path: Option<PathBuf>,
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            link_path: Self::default_link_path(),
            log_level: Self::default_log_level(),
        }
    }
}

impl BridgeSettings {
    fn default_link_path() -> Option<PathBuf> {
        Some(PathBuf::from("/tmp/ptylink0"))
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Bound on a single write to the physical port, in milliseconds
    #[serde(default = "SerialSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Pump read-poll interval, in milliseconds; bounds session close time
    #[serde(default = "SerialSettings::default_pump_poll_ms")]
    pub pump_poll_ms: u64,
    /// Line speed used when a frame carries an unresolvable baud code
    #[serde(default = "SerialSettings::default_fallback_baud")]
    pub fallback_baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: Self::default_write_timeout_ms(),
            pump_poll_ms: Self::default_pump_poll_ms(),
            fallback_baud: Self::default_fallback_baud(),
        }
    }
}

impl SerialSettings {
    fn default_write_timeout_ms() -> u64 {
        5000
    }

    fn default_pump_poll_ms() -> u64 {
        100
    }

    fn default_fallback_baud() -> u32 {
        115_200
    }

    pub fn tuning(&self) -> ManagerTuning {
        ManagerTuning {
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            pump_poll: Duration::from_millis(self.pump_poll_ms),
            fallback_baud: self.fallback_baud,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsbSettings {
    /// Extra `VID:PID` patterns accepted as candidate devices beyond the
    /// built-in adapter profiles (either part may be `*`)
    #[serde(default)]
    pub filters: Vec<String>,
}

impl BridgeConfig {
    /// Default configuration file location.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ptylink").join("bridge.toml")
        } else {
            PathBuf::from("/etc/ptylink/bridge.toml")
        }
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from the default locations, falling back to built-in defaults
    /// when no file exists.
    pub fn load_or_default() -> Self {
        let candidates = [Self::default_path(), PathBuf::from("/etc/ptylink/bridge.toml")];
        for path in &candidates {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: ignoring broken config {}: {}", path.display(), e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Write this configuration to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}
