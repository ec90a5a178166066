use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Event registry and dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Handler latencies kept per (plugin, event).
    #[serde(default = "default_events_stats_window")]
    pub stats_window: usize,
    /// Minutes between handling statistics dumps in `warden run`. Must divide
    /// an hour, or be whole hours dividing a day (60, 120, 180, ... 1440).
    #[serde(default = "default_stats_dump_minutes")]
    pub stats_dump_minutes: u32,
    /// Extra event types registered at startup, key to label.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

fn default_events_stats_window() -> usize {
    100
}

fn default_stats_dump_minutes() -> u32 {
    60
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            stats_window: default_events_stats_window(),
            stats_dump_minutes: default_stats_dump_minutes(),
            custom: BTreeMap::new(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Seconds slept past each minute boundary.
    #[serde(default = "default_minute_slack_secs")]
    pub minute_slack_secs: u32,
    #[serde(default = "default_overrun_delay_secs")]
    pub overrun_delay_secs: u64,
    /// Run durations kept per entry.
    #[serde(default = "default_cron_stats_window")]
    pub stats_window: usize,
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_minute_slack_secs() -> u32 {
    2
}

fn default_overrun_delay_secs() -> u64 {
    1
}

fn default_cron_stats_window() -> usize {
    10
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
            minute_slack_secs: default_minute_slack_secs(),
            overrun_delay_secs: default_overrun_delay_secs(),
            stats_window: default_cron_stats_window(),
        }
    }
}

/// Per-plugin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form settings handed to the plugin.
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: serde_json::Value::Null,
        }
    }
}

/// Top-level warden configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub cron: CronConfig,
    /// Plugin settings by plugin name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

impl WardenConfig {
    /// Settings for `name`, or the defaults when it is not listed.
    pub fn plugin(&self, name: &str) -> PluginConfig {
        self.plugins.get(name).cloned().unwrap_or_default()
    }
}

/// Resolve the warden config directory (~/.warden/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".warden"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.warden/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<WardenConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<WardenConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(WardenConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: WardenConfig = json5::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WardenConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.events.stats_window, 100);
        assert_eq!(config.events.stats_dump_minutes, 60);
        assert_eq!(config.cron.stop_timeout_secs, 5);
        assert_eq!(config.cron.minute_slack_secs, 2);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            logging: { level: "debug", json: true },
            events: {
                custom: { SPREE_START: "Killing spree started" },
            },
            cron: { stop_timeout_secs: 10 },
            plugins: {
                spree: { settings: { min_kills: 5 } },
                censor: { enabled: false },
            },
        }"#;
        let config: WardenConfig = json5::from_str(json5_str).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.events.stats_window, 100);
        assert_eq!(config.events.custom["SPREE_START"], "Killing spree started");
        assert_eq!(config.cron.stop_timeout_secs, 10);
        assert_eq!(config.cron.overrun_delay_secs, 1);
        assert!(config.plugin("spree").enabled);
        assert_eq!(config.plugin("spree").settings["min_kills"].as_f64(), Some(5.0));
        assert!(!config.plugin("censor").enabled);
        assert!(config.plugin("unlisted").enabled);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("warden-missing-config-test.json5");
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.cron.stats_window, 10);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("warden-config-test-{}.json5", std::process::id()));
        std::fs::write(&path, "{ events: { stats_dump_minutes: 15 } } // trailing comment").unwrap();
        let config = load_config_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.events.stats_dump_minutes, 15);

        std::fs::write(&path, "{ events: ").unwrap();
        let err = load_config_from(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Json5(_)));
    }
}
