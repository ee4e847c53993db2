//! Server configuration management

use crate::net::SessionLimits;
use crate::net::listener::USBIP_PORT;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP port to listen on
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    /// Also bind [::] for IPv6 peers
    #[serde(default = "ServerSettings::default_dual_stack")]
    pub dual_stack: bool,
    pub log_level: String,
    /// Expose every connected device in DEVLIST, not just shared ones
    #[serde(default)]
    pub devlist_all_devices: bool,
    /// Override the state directory (registry, instance lock)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl ServerSettings {
    fn default_port() -> u16 {
        USBIP_PORT
    }

    fn default_dual_stack() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Largest accepted transfer_buffer_length in bytes
    #[serde(default = "UsbSettings::default_max_transfer_len")]
    pub max_transfer_len: usize,
    /// In-flight URBs per endpoint before the reader suspends
    #[serde(default = "UsbSettings::default_per_endpoint_inflight")]
    pub per_endpoint_inflight: usize,
    /// Total outstanding payload bytes per session
    #[serde(default = "UsbSettings::default_payload_budget")]
    pub payload_budget: usize,
}

impl UsbSettings {
    fn default_max_transfer_len() -> usize {
        16 * 1024 * 1024
    }

    fn default_per_endpoint_inflight() -> usize {
        32
    }

    fn default_payload_budget() -> usize {
        64 * 1024 * 1024
    }
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            max_transfer_len: Self::default_max_transfer_len(),
            per_endpoint_inflight: Self::default_per_endpoint_inflight(),
            payload_budget: Self::default_payload_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaptureSettings {
    /// Write per-URB records to a pcapng file
    #[serde(default)]
    pub enabled: bool,
    /// Capture file path; defaults to `<state_dir>/capture.pcapng`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                port: ServerSettings::default_port(),
                dual_stack: true,
                log_level: "info".to_string(),
                devlist_all_devices: false,
                state_dir: None,
            },
            usb: UsbSettings::default(),
            capture: CaptureSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-share/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-share").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-share/server.toml")
        }
    }

    /// Directory holding the registry and the instance lock
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.server.state_dir {
            return dir.clone();
        }
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usbip-share")
        } else {
            PathBuf::from("/var/lib/usbip-share")
        }
    }

    /// Path of the persistent binding registry
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir().join("devices.toml")
    }

    /// Path of the capture file when capture is enabled
    pub fn capture_path(&self) -> PathBuf {
        self.capture
            .path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("capture.pcapng"))
    }

    /// Session limits derived from the USB settings
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_transfer_len: self.usb.max_transfer_len,
            per_endpoint_inflight: self.usb.per_endpoint_inflight,
            payload_budget: self.usb.payload_budget,
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.max_transfer_len == 0 || self.usb.per_endpoint_inflight == 0 {
            return Err(anyhow!("USB limits must be non-zero"));
        }
        if self.usb.max_transfer_len > self.usb.payload_budget {
            return Err(anyhow!(
                "max_transfer_len ({}) exceeds payload_budget ({})",
                self.usb.max_transfer_len,
                self.usb.payload_budget
            ));
        }
        if self.usb.max_transfer_len > u32::MAX as usize {
            return Err(anyhow!("max_transfer_len does not fit the wire field"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 3240);
        assert_eq!(config.server.log_level, "info");
        assert!(!config.server.devlist_all_devices);
        assert_eq!(config.usb.max_transfer_len, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = ServerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.port, parsed.server.port);
        assert_eq!(config.usb.payload_budget, parsed.usb.payload_budget);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
[server]
log_level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 3240);
        assert_eq!(config.usb.per_endpoint_inflight, 32);
        assert!(!config.capture.enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.server.log_level = "noisy".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.usb.max_transfer_len = config.usb.payload_budget + 1;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.usb.per_endpoint_inflight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_dir_override() {
        let mut config = ServerConfig::default();
        config.server.state_dir = Some(PathBuf::from("/tmp/usbip-test"));
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/usbip-test/devices.toml"));
        assert_eq!(
            config.capture_path(),
            PathBuf::from("/tmp/usbip-test/capture.pcapng")
        );
    }
}
