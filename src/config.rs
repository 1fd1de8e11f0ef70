use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::notify::clamp_notify_delay;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Where paired-server credentials come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// JSON credential file written by the pairing flow.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    /// Base URL of the pairing sidecar used for credential refresh.
    /// Refresh is skipped when unset.
    #[serde(default)]
    pub refresh_url: Option<String>,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Case-insensitive substring marking a shop name as ally-owned.
    /// Empty means no shop is treated as ally.
    #[serde(default)]
    pub ally_prefix: String,
    /// Seconds between market refresh cycles.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Seconds between outbound chat messages. Clamped to 0.5..=5.
    #[serde(default = "default_notify_delay")]
    pub notify_delay_secs: f64,
    /// Refresh cycles a listing key may stay absent before the stock
    /// tracker and announcement set forget it.
    #[serde(default = "default_sweep_horizon")]
    pub sweep_horizon_cycles: u64,
    /// Prefix on every outbound chat line. Inbound messages starting with
    /// it are ignored so the watcher never reacts to its own chatter.
    #[serde(default = "default_bot_prefix")]
    pub bot_prefix: String,
    /// Item database JSON file mapping numeric item ids to names.
    #[serde(default)]
    pub item_database: Option<String>,
}

fn default_credentials_path() -> String {
    "server.json".to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_notify_delay() -> f64 {
    1.0
}

fn default_sweep_horizon() -> u64 {
    120
}

fn default_bot_prefix() -> String {
    "[vendwatch]".to_string()
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            refresh_url: None,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            ally_prefix: String::new(),
            refresh_interval_secs: default_refresh_interval(),
            notify_delay_secs: default_notify_delay(),
            sweep_horizon_cycles: default_sweep_horizon(),
            bot_prefix: default_bot_prefix(),
            item_database: None,
        }
    }
}

impl SettingsConfig {
    /// Inter-message delay with the clamp applied.
    pub fn notify_delay(&self) -> Duration {
        clamp_notify_delay(self.notify_delay_secs)
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load config, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
