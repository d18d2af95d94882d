//! Inference engine implementation
//!
//! Owns the model lifecycle and serializes every operation on it.
//!
//! # Architecture
//!
//! The loaded [`ModelHandle`] lives in a [`Slot`] behind one fair async mutex.
//! Loads, swaps and whole generations each run while holding that mutex, so
//! the engine is strictly single-flight. Model code is blocking, so it runs on
//! `spawn_blocking` workers that own the lock guard for as long as they touch
//! the handle. Generated text reaches the caller through a bounded channel
//! (see [`crate::inference::streaming`]).

use std::ops::{ControlFlow, Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::inference::backend::{ModelHandle, ModelLoader};
use crate::inference::config::{EngineConfig, SamplingConfig};
use crate::inference::model::ModelError;
use crate::inference::stop::StopFilter;
use crate::inference::streaming::{FragmentStream, StreamEvent, FRAGMENT_BUFFER};
use crate::types::Transcript;

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("No model loaded")]
    NotInitialized,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Cancellation is an expected outcome, not a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelLoad(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Worker(e.to_string())
    }
}

/// Top-level engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// No model loaded
    Unloaded,
    /// A load or swap is running
    Loading,
    /// A model is loaded and idle
    Ready,
    /// A generation holds the model
    Busy,
}

/// Lock-free snapshot of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub model_path: Option<PathBuf>,
}

/// The guarded resource. Only reachable through the engine mutex.
pub(crate) struct Slot {
    handle: Option<Box<dyn ModelHandle>>,
    status: watch::Sender<EngineStatus>,
}

impl Slot {
    fn publish(&self, state: EngineState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Derives the resting state from whether a handle is present.
    fn settle(&self) {
        let path = self.handle.as_ref().map(|h| h.path().to_path_buf());
        let state = if path.is_some() {
            EngineState::Ready
        } else {
            EngineState::Unloaded
        };
        self.status.send_modify(|status| {
            status.state = state;
            status.model_path = path;
        });
    }
}

/// Exclusive access to the slot.
///
/// Publishes a transient state (`Loading` or `Busy`) while alive and settles
/// back to `Ready`/`Unloaded` when dropped, on every exit path.
pub(crate) struct Exclusive {
    guard: OwnedMutexGuard<Slot>,
}

impl Exclusive {
    fn enter(guard: OwnedMutexGuard<Slot>, state: EngineState) -> Self {
        guard.publish(state);
        Self { guard }
    }
}

impl Deref for Exclusive {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.guard
    }
}

impl DerefMut for Exclusive {
    fn deref_mut(&mut self) -> &mut Slot {
        &mut self.guard
    }
}

impl Drop for Exclusive {
    fn drop(&mut self) {
        self.guard.settle();
    }
}

/// Single-flight chat engine over one swappable model
pub struct ChatEngine {
    config: EngineConfig,
    loader: Arc<dyn ModelLoader>,
    slot: Arc<Mutex<Slot>>,
    status: watch::Receiver<EngineStatus>,
}

impl ChatEngine {
    /// Creates an engine in the `Unloaded` state. Nothing is loaded until
    /// [`ChatEngine::initialize`] or [`ChatEngine::swap_model`] is called.
    pub fn new(config: EngineConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, EngineError> {
        let config = config.validated()?;
        let (status_tx, status) = watch::channel(EngineStatus {
            state: EngineState::Unloaded,
            model_path: None,
        });

        Ok(Self {
            config,
            loader,
            slot: Arc::new(Mutex::new(Slot {
                handle: None,
                status: status_tx,
            })),
            status,
        })
    }

    /// Path of the loaded model. May already reflect a swap in progress.
    pub fn current_model_path(&self) -> Option<PathBuf> {
        self.status.borrow().model_path.clone()
    }

    pub fn state(&self) -> EngineState {
        self.status.borrow().state
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Loads the configured model unless a model is already loaded.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let guard = self.slot.clone().lock_owned().await;
        if guard.handle.is_some() {
            tracing::debug!("Engine already initialized, skipping load");
            return Ok(());
        }
        let path = self.config.model_path.clone();
        self.load_locked(guard, path).await
    }

    /// Replaces the loaded model with the one at `path`.
    ///
    /// Waits for any in-flight generation. The current model stays loaded
    /// until the new one has loaded successfully; on failure the engine keeps
    /// serving the old model and the error is returned.
    pub async fn swap_model(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let guard = self.slot.clone().lock_owned().await;
        self.load_locked(guard, path.as_ref().to_path_buf()).await
    }

    /// Drops the loaded model and frees its memory.
    pub async fn unload(&self) {
        let guard = self.slot.clone().lock_owned().await;
        let mut exclusive = Exclusive::enter(guard, EngineState::Loading);
        if let Some(handle) = exclusive.handle.take() {
            tracing::info!("Unloading model {}", handle.path().display());
        }
    }

    async fn load_locked(
        &self,
        guard: OwnedMutexGuard<Slot>,
        path: PathBuf,
    ) -> Result<(), EngineError> {
        let loader = Arc::clone(&self.loader);
        let params = self.config.load_params();

        // The guard moves into the worker so the lock is held until the load
        // has finished, even if this future is dropped.
        tokio::task::spawn_blocking(move || {
            let mut exclusive = Exclusive::enter(guard, EngineState::Loading);
            tracing::info!("Loading model {}", path.display());

            match loader.load(&path, &params) {
                Ok(handle) => {
                    if let Some(old) = exclusive.handle.replace(handle) {
                        tracing::info!("Released model {}", old.path().display());
                    }
                    tracing::info!("Model loaded: {}", path.display());
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Failed to load {}: {}", path.display(), e);
                    Err(e)
                }
            }
        })
        .await?
    }

    /// Starts a generation for `prompt` and returns its fragment stream.
    ///
    /// Waits for the execution lock first; `cancel` also aborts that wait.
    /// The lock stays held until the returned stream is drained or dropped.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, EngineError> {
        if prompt.trim().is_empty() {
            return Err(EngineError::InvalidRequest("prompt is empty".to_string()));
        }

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            guard = self.slot.clone().lock_owned() => guard,
        };
        if guard.handle.is_none() {
            return Err(EngineError::NotInitialized);
        }

        let exclusive = Exclusive::enter(guard, EngineState::Busy);
        tracing::debug!(
            "Generating for prompt: {}",
            crate::truncate_str(prompt, 64)
        );

        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let producer = Producer {
            tx,
            token: token.clone(),
            runtime: Handle::current(),
            filter: StopFilter::new(&self.config.sampling.stop_strings),
            produced: 0,
            max_tokens: self.config.sampling.max_tokens,
        };
        let transcript = Transcript::new(&self.config.sampling.system_prompt, prompt);
        let sampling = self.config.sampling.clone();

        tokio::task::spawn_blocking(move || producer.run(exclusive, transcript, sampling));

        Ok(FragmentStream::new(rx, token))
    }

    /// Runs a generation to completion and returns the whole reply.
    ///
    /// Blank prompts return an empty reply without touching the model.
    /// Cancellation discards any partial output.
    pub async fn generate_full(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        if prompt.trim().is_empty() {
            return Ok(String::new());
        }
        self.generate_stream(prompt, cancel)
            .await?
            .collect_text()
            .await
    }
}

/// Generation worker state. Runs on a blocking thread.
struct Producer {
    tx: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
    runtime: Handle,
    filter: StopFilter,
    produced: u32,
    max_tokens: u32,
}

impl Producer {
    fn run(mut self, mut exclusive: Exclusive, transcript: Transcript, sampling: SamplingConfig) {
        let result = match exclusive.handle.as_mut() {
            Some(handle) => handle.generate(&transcript, &sampling, &mut |piece| self.accept(piece)),
            None => Err(EngineError::NotInitialized),
        };

        if self.token.is_cancelled() {
            tracing::debug!("Generation cancelled after {} tokens", self.produced);
            return;
        }

        // Text held back as a possible stop prefix is real output, even when
        // the backend failed afterwards.
        if !self.filter.is_stopped() {
            let rest = self.filter.finish();
            self.emit(rest);
        }

        match result {
            Ok(()) => {
                tracing::debug!("Generation finished after {} tokens", self.produced);
            }
            Err(e) => {
                tracing::warn!("Generation failed: {}", e);
                self.send(StreamEvent::Failed(e));
            }
        }

        // Hand the guard to the consumer; if it is gone the guard drops here.
        self.send(StreamEvent::Finished(exclusive));
    }

    /// Sink for backend pieces: applies stop strings, the token budget and
    /// cancellation.
    fn accept(&mut self, piece: &str) -> ControlFlow<()> {
        if self.token.is_cancelled() {
            return ControlFlow::Break(());
        }

        self.produced += 1;
        let step = self.filter.push(piece);
        if !self.emit(step.text) || step.stopped || self.produced >= self.max_tokens {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn emit(&self, text: String) -> bool {
        text.is_empty() || self.send(StreamEvent::Fragment(text))
    }

    /// Waits for channel capacity unless the caller cancels first.
    fn send(&self, event: StreamEvent) -> bool {
        let tx = &self.tx;
        let token = &self.token;
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = token.cancelled() => false,
                sent = tx.send(event) => sent.is_ok(),
            }
        })
    }
}
