//! plotctl configuration management

use anyhow::{Context, Result, anyhow};
use engine::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlotctlConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Link timeouts and command pacing
    pub link: LinkSettings,
    /// Known plotter models, tried in listed order
    pub devices: Vec<DeviceEntry>,
}

/// Timeouts and pacing applied to the USB link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSettings {
    /// Timeout for each bulk write in milliseconds
    pub write_timeout_ms: u64,
    /// How long to wait for a command reply in milliseconds
    pub response_timeout_ms: u64,
    /// Minimum delay between consecutive commands in milliseconds
    pub command_spacing_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5000,
            response_timeout_ms: 2000,
            command_spacing_ms: 150,
        }
    }
}

impl LinkSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn command_spacing(&self) -> Duration {
        Duration::from_millis(self.command_spacing_ms)
    }
}

/// A plotter model the tool knows how to find on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    /// Model name used in logs and `--device` lookups
    pub name: String,
    /// Vendor ID, hex with 0x prefix or plain decimal
    pub vendor_id: String,
    /// Product ID; "0x0000" matches any product from the vendor
    pub product_id: String,
}

impl DeviceEntry {
    /// Parse the entry's IDs into a connection filter.
    pub fn identity(&self) -> Result<DeviceIdentity> {
        let vendor_id = parse_device_id(&self.vendor_id).with_context(|| {
            format!(
                "Device '{}' has an invalid vendor_id '{}'",
                self.name, self.vendor_id
            )
        })?;
        let product_id = parse_device_id(&self.product_id).with_context(|| {
            format!(
                "Device '{}' has an invalid product_id '{}'",
                self.name, self.product_id
            )
        })?;

        Ok(DeviceIdentity::new(vendor_id, product_id))
    }
}

/// Parse a vendor or product ID: "0x0483" (hex) or "1155" (decimal).
pub fn parse_device_id(value: &str) -> Result<u16> {
    let value = value.trim();

    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
            .map_err(|_| anyhow!("'{}' is not a valid hex ID", value))
    } else {
        value
            .parse::<u16>()
            .map_err(|_| anyhow!("'{}' is not a valid ID (use 0x-prefixed hex or decimal)", value))
    }
}

impl Default for PlotctlConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            link: LinkSettings::default(),
            devices: vec![
                DeviceEntry {
                    name: "HWJ".to_string(),
                    vendor_id: "0x0483".to_string(),
                    product_id: "0x5750".to_string(),
                },
                DeviceEntry {
                    name: "GNS".to_string(),
                    vendor_id: "0x0483".to_string(),
                    product_id: "0x5448".to_string(),
                },
            ],
        }
    }
}

impl PlotctlConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/plotterlink/plotctl.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PlotctlConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
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
            config_dir.join("plotterlink").join("plotctl.toml")
        } else {
            PathBuf::from(".config/plotterlink/plotctl.toml")
        }
    }

    /// Look up a configured device by name (case-insensitive).
    pub fn find_device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.link.write_timeout_ms == 0 {
            return Err(anyhow!("link.write_timeout_ms must be greater than 0"));
        }
        if self.link.response_timeout_ms == 0 {
            return Err(anyhow!("link.response_timeout_ms must be greater than 0"));
        }

        // Validate device entries
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(anyhow!("Device entry with empty name"));
            }
            device.identity()?;
        }

        Ok(())
    }
}
