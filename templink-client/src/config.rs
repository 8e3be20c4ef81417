//! Configuration loading for the templink client.
//!
//! Required fields have no defaults. `locale`, `view`, the device id
//! override and the watch list are optional.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use templink_core::Variables;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub ws_endpoint: String,
    pub access_token: String,
    pub user: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub view: String,
    pub device: DeviceConfig,
    pub reconnect: ReconnectConfig,
    #[serde(default, rename = "watch")]
    pub watches: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// File the generated device id is persisted in.
    pub path: PathBuf,
    /// Fixed id to store instead; `"clear"` discards the stored one.
    #[serde(default)]
    pub id_override: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

/// One template the CLI keeps rendered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub variables: toml::Table,
}

impl WatchConfig {
    /// The variables table as template variables.
    pub fn variables(&self) -> Result<Variables, ConfigError> {
        match serde_json::to_value(&self.variables) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Ok(Variables::new()),
            Err(err) => Err(ConfigError::InvalidValue {
                field: "watch.variables",
                reason: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TEMPLINK_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if !(self.ws_endpoint.starts_with("ws://") || self.ws_endpoint.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                field: "ws_endpoint",
                reason: "must start with ws:// or wss://".to_string(),
            });
        }
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "access_token",
                reason: "must not be empty".to_string(),
            });
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "user",
                reason: "must not be empty".to_string(),
            });
        }
        if self.device.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "device.path",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(id) = &self.device.id_override {
            if id.trim().is_empty() || id.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    field: "device.id_override",
                    reason: "must be a non-empty id without whitespace".to_string(),
                });
            }
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        // NaN compares false both ways and would collapse the backoff to zero.
        if !(self.reconnect.multiplier.is_finite() && self.reconnect.multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.multiplier",
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }

        let mut names = HashSet::new();
        for watch in &self.watches {
            if watch.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "watch.name",
                    reason: "must not be empty".to_string(),
                });
            }
            if !names.insert(watch.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "watch.name",
                    reason: format!("duplicate watch '{}'", watch.name),
                });
            }
            if watch.template.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "watch.template",
                    reason: format!("watch '{}' has an empty template", watch.name),
                });
            }
            watch.variables()?;
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("TEMPLINK_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
