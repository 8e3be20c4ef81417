//! Persistence for the per-install device id.
//!
//! The id is generated once (`xxxxxxxx-xxxxxxxx`, lowercase hex) and kept in
//! a small JSON file so every run of the same install renders with the same
//! `browser` variable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Override value that discards the stored id.
pub const CLEAR_OVERRIDE: &str = "clear";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedDevice {
    device_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid device id {0:?}")]
    Invalid(String),
}

/// Generate a fresh id from eight random bytes.
pub fn generate() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!("{}-{}", hex::encode(&bytes[..4]), hex::encode(&bytes[4..8]))
}

#[derive(Debug, Clone)]
pub struct DeviceIdStore {
    path: PathBuf,
}

impl DeviceIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<String>, DeviceIdError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let stored = serde_json::from_str::<PersistedDevice>(&contents)?;
        if stored.device_id.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(stored.device_id))
    }

    pub fn save(&self, device_id: &str) -> Result<(), DeviceIdError> {
        if device_id.trim().is_empty() || device_id.chars().any(char::is_whitespace) {
            return Err(DeviceIdError::Invalid(device_id.to_string()));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&PersistedDevice {
            device_id: device_id.to_string(),
        })?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), DeviceIdError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The id to render with.
    ///
    /// An override is stored and returned, except [`CLEAR_OVERRIDE`], which
    /// discards the stored id. Without a stored id a new one is generated
    /// and persisted. A stored id that cannot be read back is treated as
    /// absent and replaced.
    pub fn resolve(&self, id_override: Option<&str>) -> Result<String, DeviceIdError> {
        match id_override {
            Some(CLEAR_OVERRIDE) => {
                self.clear()?;
                info!(path = %self.path.display(), "Cleared stored device id");
            }
            Some(id) => {
                self.save(id)?;
                return Ok(id.to_string());
            }
            None => match self.load() {
                Ok(Some(id)) => return Ok(id),
                Ok(None) => {}
                Err(DeviceIdError::Serde(err)) => {
                    warn!(path = %self.path.display(), error = %err, "Stored device id unreadable, regenerating");
                }
                Err(err) => return Err(err),
            },
        }

        let id = generate();
        self.save(&id)?;
        info!(device_id = %id, "Generated device id");
        Ok(id)
    }
}
