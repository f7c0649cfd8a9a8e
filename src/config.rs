//! Configuration file management for the Fossibot client.
//!
//! Handles loading and saving account configuration from
//! `~/.config/fossibot/config.toml`. The configuration holds the cloud
//! credentials, the developer-mode flag, and the scan interval.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Default seconds between polls.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

/// Application configuration stored in `~/.config/fossibot/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Cloud account settings.
    pub account: AccountConfig,
}

/// Fossibot/BrightEMS account settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Account email or username registered in the vendor app.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Use the developer-mode broker fallback instead of production.
    #[serde(default)]
    pub developer_mode: bool,
    /// Seconds between polls (defaults to 30).
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

impl Config {
    pub fn load() -> Result<Option<Self>> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(Some(config))
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Returns the path to the configuration file.
    ///
    /// The config file is stored at `~/.config/fossibot/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("fossibot").join("config.toml"))
    }
}
