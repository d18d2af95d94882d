//! Engine and sampling configuration
//!
//! Both values are immutable once an engine has been built from them. A model
//! swap reuses the same configuration with a different weights path.

use std::path::PathBuf;

use crate::inference::engine::EngineError;
use crate::storage::settings::AppSettings;

/// Generation parameters applied to every request
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// System prompt placed at the top of each transcript
    pub system_prompt: String,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Repetition penalty
    pub repeat_penalty: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Stop strings, matched against the accumulated output in order
    pub stop_strings: Vec<String>,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 512,
            stop_strings: Vec::new(),
            seed: 0,
        }
    }
}

/// Parameters a loader needs to build a model handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
}

/// Complete configuration of one engine instance
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Weights loaded by `initialize`
    pub model_path: PathBuf,
    /// Context window size in tokens
    pub context_size: u32,
    /// CPU threads used for decoding
    pub threads: u32,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    pub sampling: SamplingConfig,
}

impl EngineConfig {
    /// Creates a configuration with default sampling for the given model.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: 4096,
            threads: default_threads(),
            gpu_layers: 0,
            sampling: SamplingConfig::default(),
        }
    }

    /// Builds the engine configuration described by the application settings.
    ///
    /// The model path is the default model joined onto the models directory.
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            model_path: settings.models_path.join(&settings.default_model),
            context_size: settings.context_size,
            threads: settings.threads,
            gpu_layers: settings.gpu_layers,
            sampling: SamplingConfig {
                system_prompt: settings.init_prompt.clone(),
                temperature: settings.temperature,
                top_p: settings.top_p,
                top_k: settings.top_k,
                repeat_penalty: settings.repeat_penalty,
                max_tokens: settings.max_tokens,
                stop_strings: settings.anti_prompts.clone(),
                seed: 0,
            },
        }
    }

    /// Checks the invariants and clamps the thread count.
    ///
    /// Threads are raised to at least `available cores - 1`, and never below 1.
    pub fn validated(mut self) -> Result<Self, EngineError> {
        if self.context_size == 0 {
            return Err(EngineError::InvalidRequest(
                "context size must be greater than zero".to_string(),
            ));
        }
        if self.sampling.max_tokens == 0 {
            return Err(EngineError::InvalidRequest(
                "max tokens must be greater than zero".to_string(),
            ));
        }
        self.sampling.stop_strings.retain(|s| !s.is_empty());
        self.threads = self.threads.max(default_threads());
        Ok(self)
    }

    /// Parameters forwarded to the model loader
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            context_size: self.context_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
        }
    }
}

/// `available cores - 1`, at least 1
fn default_threads() -> u32 {
    (num_cpus::get() as u32).saturating_sub(1).max(1)
}
