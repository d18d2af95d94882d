//! LLM inference engine
//!
//! Model lifecycle, single-flight generation and fragment streaming. The
//! llama.cpp backend lives in [`llama`]; everything else is backend-agnostic.

pub mod backend;
pub mod config;
pub mod engine;
pub mod llama;
pub mod model;
pub mod stop;
pub mod streaming;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types for convenience
pub use backend::{FragmentSink, ModelHandle, ModelLoader};
pub use config::{EngineConfig, LoadParams, SamplingConfig};
pub use engine::{ChatEngine, EngineError, EngineState, EngineStatus};
pub use llama::LlamaLoader;
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use stop::{Filtered, StopFilter};
pub use streaming::FragmentStream;
