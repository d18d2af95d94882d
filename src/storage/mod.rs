//! Configuration and on-disk model storage
//!
//! Settings file loading and the model catalog (the directory of `.gguf`
//! files the gateway can switch between).

use std::path::PathBuf;
use thiserror::Error;

pub mod catalog;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Settings file not found: {0}")]
    SettingsNotFound(PathBuf),
    #[error("Models path must be absolute: {0}")]
    RelativeModelsPath(PathBuf),
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
}

/// Get the application config directory
///
/// Returns the platform-specific config directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\llamagate\llamagate\config`
/// - macOS: `/Users/{user}/Library/Application Support/com.llamagate.llamagate`
/// - Linux: `/home/{user}/.config/llamagate`
pub fn get_config_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llamagate", "llamagate")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            StorageError::ConfigDirError("Could not determine config directory".to_string())
        })
}

/// Get the default models directory (`{data_dir}/models`)
pub fn get_default_models_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llamagate", "llamagate")
        .map(|dirs| dirs.data_dir().join("models"))
        .ok_or_else(|| StorageError::ConfigDirError("Could not determine data directory".to_string()))
}
