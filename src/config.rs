//! Configuration file handling with TOML support.

use crate::connection::ConnectionSettings;
use crate::store::{DEFAULT_THROTTLE_WINDOW, StoreSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Streaming connection tuning
    #[serde(default)]
    pub stream: StreamConfig,

    /// Initial watchlist, used when no saved state exists
    #[serde(default)]
    pub watchlist: Vec<WatchlistEntry>,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Base URL of the quote service
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// REST request timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Nominal polling cadence while the stream is down
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Use the live price stream
    #[serde(default = "default_true")]
    pub live_data: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout: default_timeout(),
            refresh_interval: default_refresh_interval(),
            live_data: true,
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}

/// Streaming connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    #[serde(default = "default_resubscribe_debounce", with = "humantime_serde")]
    pub resubscribe_debounce: Duration,

    #[serde(default = "default_open_retry_delay", with = "humantime_serde")]
    pub open_retry_delay: Duration,

    /// Minimum spacing of accepted price updates per symbol
    #[serde(default = "default_throttle", with = "humantime_serde")]
    pub throttle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            resubscribe_debounce: default_resubscribe_debounce(),
            open_retry_delay: default_open_retry_delay(),
            throttle: default_throttle(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    ConnectionSettings::default().connect_timeout
}
fn default_backoff_base() -> Duration {
    ConnectionSettings::default().backoff_base
}
fn default_backoff_max() -> Duration {
    ConnectionSettings::default().backoff_max
}
fn default_resubscribe_debounce() -> Duration {
    ConnectionSettings::default().resubscribe_debounce
}
fn default_open_retry_delay() -> Duration {
    ConnectionSettings::default().open_retry_delay
}
fn default_throttle() -> Duration {
    DEFAULT_THROTTLE_WINDOW
}

/// One configured watchlist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    /// Ticker symbol
    pub symbol: String,
    /// Display name, defaults to the symbol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Alert threshold
    pub alert_price: f64,
}

/// Serde adapter for humantime duration strings such as `"15s"` or `"250ms"`.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from default location or create default.
    pub fn load_or_default() -> Self {
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    }
                }
            }
        }
        Config::default()
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("stockwatch").join("config.toml"))
    }

    /// Save configuration to file.
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Store settings derived from this configuration.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            throttle_window: self.stream.throttle,
            refresh_interval: self.general.refresh_interval,
            live_data_enabled: self.general.live_data,
            connection: ConnectionSettings {
                connect_timeout: self.stream.connect_timeout,
                backoff_base: self.stream.backoff_base,
                backoff_max: self.stream.backoff_max,
                resubscribe_debounce: self.stream.resubscribe_debounce,
                open_retry_delay: self.stream.open_retry_delay,
            },
        }
    }
}

/// Generate a sample configuration file content.
pub fn sample_config() -> &'static str {
    r##"# stockwatch configuration file

[general]
# Quote service base URL
api_url = "http://localhost:3000"
# REST request timeout
timeout = "10s"
# Polling cadence while the live stream is down (never below 30s)
refresh_interval = "30s"
# Use the live price stream
live_data = true

[stream]
connect_timeout = "15s"
backoff_base = "1s"
backoff_max = "30s"
resubscribe_debounce = "250ms"
open_retry_delay = "3s"
# Drop price updates closer together than this, per symbol
throttle = "1s"

# Initial watchlist (ignored once a saved watchlist exists)
[[watchlist]]
symbol = "AAPL"
name = "Apple Inc."
alert_price = 200.0

[[watchlist]]
symbol = "MSFT"
alert_price = 450.0
"##
}
