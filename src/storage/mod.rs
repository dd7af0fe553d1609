//! Persistent storage
//!
//! Locates the platform configuration directory and persists session
//! configurations.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

pub use settings::{default_config_path, load_config, load_config_or_default, save_config};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the configuration directory
///
/// Returns the platform-specific configuration directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\LlamaSession\llama-session\config`
/// - macOS: `/Users/{user}/Library/Application Support/com.LlamaSession.llama-session`
/// - Linux: `/home/{user}/.config/llama-session`
pub fn get_config_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LlamaSession", "llama-session")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            StorageError::ConfigDirError("Could not determine config directory".to_string())
        })
}
