//! SDK configuration loading from file and environment variables.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level SDK configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rules pipeline settings.
    #[serde(default)]
    pub rules: RulesConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory that holds the datastore collections and queue databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Rules pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesConfig {
    /// Remote rules archive URL, if any.
    #[serde(default)]
    pub url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "pulse_hub=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("pulse-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PULSE_DATA_DIR` overrides `storage.data_dir`
/// - `PULSE_RULES_URL` overrides `rules.url`
/// - `PULSE_LOG_LEVEL` overrides `logging.level`
/// - `PULSE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(dir) = std::env::var("PULSE_DATA_DIR") {
        config.storage.data_dir = PathBuf::from(dir);
    }
    if let Ok(url) = std::env::var("PULSE_RULES_URL") {
        config.rules.url = Some(url);
    }
    if let Ok(level) = std::env::var("PULSE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PULSE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
