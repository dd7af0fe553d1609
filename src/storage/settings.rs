//! Configuration storage
//!
//! Saves and loads [`SessionConfig`] values as pretty-printed JSON. Loading
//! does not validate; a session validates its configuration when it is
//! constructed.

use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::SessionConfig;
use crate::storage::{get_config_dir, StorageError};

/// Default location of the session configuration file
pub fn default_config_path() -> Result<PathBuf, StorageError> {
    Ok(get_config_dir()?.join("session.json"))
}

/// Load a configuration from disk
///
/// Fields missing from the file take their default values.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SessionConfig, StorageError> {
    let json = fs::read_to_string(path.as_ref())?;
    let config: SessionConfig = serde_json::from_str(&json)?;

    tracing::debug!("Loaded session config from {}", path.as_ref().display());
    Ok(config)
}

/// Load a configuration, falling back to defaults
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> SessionConfig {
    let path = path.as_ref();
    if !path.exists() {
        tracing::info!("Config file not found, using defaults");
        return SessionConfig::default();
    }

    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            SessionConfig::default()
        }
    }
}

/// Save a configuration to disk
pub fn save_config<P: AsRef<Path>>(path: P, config: &SessionConfig) -> Result<(), StorageError> {
    let path = path.as_ref();

    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved session config to {}", path.display());
    Ok(())
}
