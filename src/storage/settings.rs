//! Settings storage
//!
//! Reads the gateway settings from a JSON file with a top-level
//! `AppSettings` section:
//!
//! ```json
//! {
//!   "AppSettings": {
//!     "DefaultModel": "mistral-7b.Q4_K_M.gguf",
//!     "ModelsPath": "/srv/models",
//!     "Address": "http://0.0.0.0:5000",
//!     "InitPrompt": "You are a helpful AI assistant.",
//!     "AntiPrompts": ["User:"],
//!     "MaxTokens": 512
//!   }
//! }
//! ```
//!
//! Missing keys take their default values.

use crate::storage::{get_config_dir, get_default_models_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Settings file name looked up in the working and config directories
pub const SETTINGS_FILE: &str = "appsettings.json";

/// Gateway settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppSettings {
    /// File name of the model loaded at startup, relative to `models_path`
    pub default_model: String,
    /// Directory where model files (.gguf) are stored; must be absolute
    pub models_path: PathBuf,
    /// Listen address, e.g. `http://0.0.0.0:5000`
    pub address: String,
    /// System prompt prepended to every request
    pub init_prompt: String,
    /// Stop strings
    pub anti_prompts: Vec<String>,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    pub repeat_penalty: f32,
    /// Decode threads; raised to at least `cores - 1`
    pub threads: u32,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_model: String::new(),
            models_path: get_default_models_dir().unwrap_or_else(|_| PathBuf::from("./models")),
            address: "http://127.0.0.1:5000".to_string(),
            init_prompt: "You are a helpful AI assistant.".to_string(),
            anti_prompts: vec!["User:".to_string()],
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            threads: 0,
            context_size: 4096,
            gpu_layers: 0,
        }
    }
}

/// On-disk layout: settings live under an `AppSettings` key
#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(rename = "AppSettings")]
    app_settings: AppSettings,
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        // Clamp temperature between 0.0 and 2.0
        self.temperature = self.temperature.clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }

        if self.context_size == 0 {
            self.context_size = 4096;
        }

        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.0;
        }

        self.anti_prompts.retain(|s| !s.is_empty());
    }

    /// Socket address to bind, parsed from `address`.
    ///
    /// Accepts an optional `http://` scheme and the host aliases
    /// `localhost`, `*` and `+`.
    pub fn bind_addr(&self) -> Result<SocketAddr, StorageError> {
        let raw = self.address.trim();
        let authority = raw
            .strip_prefix("http://")
            .unwrap_or(raw)
            .trim_end_matches('/');

        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| StorageError::InvalidAddress(self.address.clone()))?;
        let host = match host {
            "localhost" => "127.0.0.1",
            "*" | "+" => "0.0.0.0",
            other => other,
        };

        format!("{host}:{port}")
            .parse()
            .map_err(|_| StorageError::InvalidAddress(self.address.clone()))
    }
}

/// Resolves which settings file to read.
///
/// An explicit path is used as given. Otherwise `./appsettings.json` is
/// preferred, then the platform config directory.
pub fn find_settings_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let local = PathBuf::from(SETTINGS_FILE);
    if local.is_file() {
        return Some(local);
    }

    get_config_dir()
        .ok()
        .map(|dir| dir.join(SETTINGS_FILE))
        .filter(|path| path.is_file())
}

/// Load settings
///
/// An explicitly requested file must exist. Without one, defaults are used
/// when no settings file can be found.
pub fn load_settings(explicit: Option<&Path>) -> Result<AppSettings, StorageError> {
    let Some(path) = find_settings_file(explicit) else {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    };

    if !path.is_file() {
        return Err(StorageError::SettingsNotFound(path));
    }

    let settings = load_settings_from(&path)?;
    tracing::info!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Reads and validates one settings file
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    let json = fs::read_to_string(path)?;
    let file: SettingsFile = serde_json::from_str(&json)?;
    let mut settings = file.app_settings;
    settings.validate();
    Ok(settings)
}
