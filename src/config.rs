use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub requests: RequestConfig,
}

/// Listening endpoint and shutdown behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long `stop()` waits for connection handlers before abandoning them.
    pub shutdown_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            shutdown_timeout_secs: 5.0,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        secs_or(self.shutdown_timeout_secs, 5.0)
    }
}

/// Default per-request deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub state_timeout_secs: f64,
    pub action_timeout_secs: f64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            state_timeout_secs: 30.0,
            action_timeout_secs: 30.0,
        }
    }
}

impl RequestConfig {
    pub fn state_timeout(&self) -> Duration {
        secs_or(self.state_timeout_secs, 30.0)
    }

    pub fn action_timeout(&self) -> Duration {
        secs_or(self.action_timeout_secs, 30.0)
    }
}

fn secs_or(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

impl BridgeConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("server.shutdown_timeout_secs", self.server.shutdown_timeout_secs),
            ("requests.state_timeout_secs", self.requests.state_timeout_secs),
            ("requests.action_timeout_secs", self.requests.action_timeout_secs),
        ];
        for (name, value) in timeouts {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number of seconds (got {})",
                    name, value
                )));
            }
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        Ok(())
    }
}

/// Default config location: `<config dir>/pagelink/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pagelink").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}
