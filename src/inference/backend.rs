//! Model backend seam
//!
//! The engine only knows these two traits. [`crate::inference::llama`]
//! provides the llama.cpp implementation; tests plug in a scripted one.

use std::ops::ControlFlow;
use std::path::Path;

use crate::inference::config::{LoadParams, SamplingConfig};
use crate::inference::engine::EngineError;
use crate::types::Transcript;

/// Receives each decoded piece of text. Returning `Break` asks the backend to
/// stop generating as soon as possible.
pub type FragmentSink<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

/// A loaded model together with whatever it needs to run generation.
///
/// Handles are owned by exactly one engine and are only touched while that
/// engine's execution lock is held, so implementations need not be `Sync`.
pub trait ModelHandle: Send {
    /// Path the handle was loaded from
    fn path(&self) -> &Path;

    /// Runs one generation for `transcript`, feeding pieces to `sink` in
    /// order until the model ends its turn or the sink breaks.
    ///
    /// This call blocks; the engine runs it on a blocking worker thread.
    fn generate(
        &mut self,
        transcript: &Transcript,
        sampling: &SamplingConfig,
        sink: &mut FragmentSink<'_>,
    ) -> Result<(), EngineError>;
}

/// Creates model handles from weight files
pub trait ModelLoader: Send + Sync + 'static {
    /// Loads the weights at `path`. Blocking and potentially slow.
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Box<dyn ModelHandle>, EngineError>;
}
