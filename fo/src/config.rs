//! Fanout configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main Fanout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default aggregation timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Where the process manager puts identity in the environment
    pub identity: IdentityConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            identity: IdentityConfig::default(),
            log_level: None,
        }
    }
}

impl Config {
    /// Default aggregation timeout as a Duration
    pub fn timeout(&self) -> Duration {
        debug!(timeout_ms = %self.timeout_ms, "Config::timeout: called");
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .fanout.yml
        let local_config = PathBuf::from(".fanout.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/fanout/fanout.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fanout").join("fanout.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    ///
    /// Errors are swallowed: a broken config file is reported later by `load`.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => [Some(PathBuf::from(".fanout.yml")), dirs::config_dir().map(|d| d.join("fanout").join("fanout.yml"))]
                .into_iter()
                .flatten()
                .find(|p| p.exists())?,
        };
        Self::load_from_file(path).ok()?.log_level
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Environment variables carrying the instance identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Variable holding the numeric instance id
    #[serde(rename = "id-env")]
    pub id_env: String,

    /// Variable holding the instance name
    #[serde(rename = "name-env")]
    pub name_env: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id_env: procbus::ID_ENV.to_string(),
            name_env: procbus::NAME_ENV.to_string(),
        }
    }
}
