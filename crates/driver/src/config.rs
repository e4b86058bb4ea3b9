//! Driver configuration management

use crate::usb::DeviceOptions;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest drain timeout accepted (one minute)
const MAX_DRAIN_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    pub log_level: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Which pad to bind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB Vendor ID, hex with `0x` prefix
    pub vendor_id: String,
    /// USB Product ID, hex with `0x` prefix
    pub product_id: String,
    /// Name announced to the event consumer
    #[serde(default = "DeviceSettings::default_name")]
    pub name: String,
    /// Interface number to claim
    #[serde(default)]
    pub interface: u8,
}

impl DeviceSettings {
    fn default_name() -> String {
        "Gamepad F310".to_string()
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: "0x046d".to_string(),
            product_id: "0xc21d".to_string(),
            name: Self::default_name(),
            interface: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Output reports allowed in flight
    #[serde(default = "TransferSettings::default_writes_in_flight")]
    pub writes_in_flight: usize,
    /// How long removal waits for pending outputs
    #[serde(default = "TransferSettings::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Timeout slice of each libusb call
    #[serde(default = "TransferSettings::default_poll_slice_ms")]
    pub poll_slice_ms: u64,
    /// Event frames buffered for the consumer
    #[serde(default = "TransferSettings::default_event_queue")]
    pub event_queue: usize,
}

impl TransferSettings {
    fn default_writes_in_flight() -> usize {
        8
    }

    fn default_drain_timeout_ms() -> u64 {
        5000
    }

    fn default_poll_slice_ms() -> u64 {
        100
    }

    fn default_event_queue() -> usize {
        256
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            writes_in_flight: Self::default_writes_in_flight(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
            poll_slice_ms: Self::default_poll_slice_ms(),
            event_queue: Self::default_event_queue(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-gamepad/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DriverConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usb-gamepad").join("driver.toml")
        } else {
            PathBuf::from(".config/usb-gamepad/driver.toml")
        }
    }

    pub fn vendor_id(&self) -> Result<u16> {
        Self::parse_hex_id(&self.device.vendor_id, "vendor_id")
    }

    pub fn product_id(&self) -> Result<u16> {
        Self::parse_hex_id(&self.device.product_id, "product_id")
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            writes_in_flight: self.transfers.writes_in_flight,
            drain_timeout: Duration::from_millis(self.transfers.drain_timeout_ms),
        }
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.transfers.poll_slice_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        self.vendor_id()?;
        self.product_id()?;

        let transfers = &self.transfers;
        if transfers.writes_in_flight == 0 {
            return Err(anyhow!("writes_in_flight must be at least 1"));
        }
        if transfers.drain_timeout_ms > MAX_DRAIN_TIMEOUT_MS {
            return Err(anyhow!(
                "drain_timeout_ms {} exceeds {}",
                transfers.drain_timeout_ms,
                MAX_DRAIN_TIMEOUT_MS
            ));
        }
        if transfers.poll_slice_ms == 0 || transfers.poll_slice_ms > transfers.drain_timeout_ms {
            return Err(anyhow!(
                "poll_slice_ms must be between 1 and drain_timeout_ms ({})",
                transfers.drain_timeout_ms
            ));
        }
        if transfers.event_queue == 0 {
            return Err(anyhow!("event_queue must be at least 1"));
        }

        Ok(())
    }

    /// Parse a hex ID (VID or PID)
    fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x046d')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.transfers.writes_in_flight, 8);
        assert_eq!(config.transfers.drain_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(DriverConfig::parse_hex_id("0x046d", "VID").unwrap(), 0x046d);
        assert_eq!(DriverConfig::parse_hex_id("0XC21D", "PID").unwrap(), 0xc21d);
        assert!(DriverConfig::parse_hex_id("046d", "VID").is_err());
        assert!(DriverConfig::parse_hex_id("0x", "VID").is_err());
        assert!(DriverConfig::parse_hex_id("0x12345", "VID").is_err());
        assert!(DriverConfig::parse_hex_id("0xGHIJ", "VID").is_err());
    }

    #[test]
    fn test_device_options() {
        let mut config = DriverConfig::default();
        config.transfers.drain_timeout_ms = 250;

        let options = config.device_options();
        assert_eq!(options.writes_in_flight, 8);
        assert_eq!(options.drain_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DriverConfig::default();
        config.driver.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.driver.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_transfer_bounds() {
        let mut config = DriverConfig::default();
        config.transfers.writes_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transfers.poll_slice_ms = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.transfers.drain_timeout_ms = MAX_DRAIN_TIMEOUT_MS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = DriverConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DriverConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.device.vendor_id, parsed.device.vendor_id);
        assert_eq!(config.transfers.event_queue, parsed.transfers.event_queue);
    }
}
