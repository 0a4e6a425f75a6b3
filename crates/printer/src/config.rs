//! Printer configuration management

use crate::usb::{AdapterSettings, DEFAULT_QUEUE_DEPTH, DEFAULT_TRANSFER_TIMEOUT};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration file
const SYSTEM_CONFIG_PATH: &str = "/etc/escpos-usb/printer.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    /// Default printer used when a command names none
    #[serde(default)]
    pub printer: PrinterSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub permission: PermissionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
}

impl PrinterSettings {
    /// Both ids, if configured
    pub fn ids(&self) -> Option<(u16, u16)> {
        self.vendor_id.zip(self.product_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk transfer timeout in seconds
    #[serde(default = "TransferSettings::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Jobs that may wait behind the running transfer
    #[serde(default = "TransferSettings::default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            queue_depth: Self::default_queue_depth(),
        }
    }
}

impl TransferSettings {
    fn default_timeout_secs() -> u64 {
        DEFAULT_TRANSFER_TIMEOUT.as_secs()
    }

    fn default_queue_depth() -> usize {
        DEFAULT_QUEUE_DEPTH
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// How long CLI commands wait for a permission decision
    #[serde(default = "PermissionSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl PermissionSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PrinterConfig {
    /// Load configuration from a file, or from the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: PrinterConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default configuration: {}", e);
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

    /// Per-user configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("escpos-usb").join("printer.toml")
        } else {
            PathBuf::from(".config/escpos-usb/printer.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.printer.vendor_id.is_some() != self.printer.product_id.is_some() {
            return Err(anyhow!(
                "printer.vendor_id and printer.product_id must be set together"
            ));
        }

        if self.transfer.timeout_secs == 0 {
            return Err(anyhow!("transfer.timeout_secs must be greater than 0"));
        }

        if self.transfer.queue_depth == 0 {
            return Err(anyhow!("transfer.queue_depth must be greater than 0"));
        }

        Ok(())
    }

    /// Adapter tunables derived from the transfer section
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            transfer_timeout: Duration::from_secs(self.transfer.timeout_secs),
            queue_depth: self.transfer.queue_depth,
        }
    }
}

/// Load configuration from a path, expanding `~`
pub fn load_config(path: &str) -> Result<PrinterConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    PrinterConfig::load(Some(path_buf))
}

/// Parse a USB vendor or product id given in decimal or `0x` hex
pub fn parse_usb_id(s: &str) -> Result<u16> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse::<u16>()
    };
    parsed.map_err(|e| anyhow!("Invalid USB id '{}': {}", s, e))
}
