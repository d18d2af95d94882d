//! Scripted model backend for tests

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::inference::backend::{FragmentSink, ModelHandle, ModelLoader};
use crate::inference::config::{LoadParams, SamplingConfig};
use crate::inference::engine::EngineError;
use crate::types::Transcript;

#[derive(Debug, Clone)]
enum Output {
    Pieces(Vec<String>),
    /// Plain-prompt rendering of the transcript as a single piece
    Echo,
    /// The user message, repeated
    EchoRepeated(usize),
}

/// What a scripted model emits for every generation
#[derive(Debug, Clone)]
pub struct Script {
    output: Output,
    fail_after: Option<usize>,
    delay: Duration,
    load_delay: Duration,
}

impl Script {
    fn with_output(output: Output) -> Self {
        Self {
            output,
            fail_after: None,
            delay: Duration::ZERO,
            load_delay: Duration::ZERO,
        }
    }

    pub fn pieces(pieces: &[&str]) -> Self {
        Self::with_output(Output::Pieces(
            pieces.iter().map(|p| p.to_string()).collect(),
        ))
    }

    pub fn repeat(piece: &str, times: usize) -> Self {
        Self::with_output(Output::Pieces(vec![piece.to_string(); times]))
    }

    pub fn echo() -> Self {
        Self::with_output(Output::Echo)
    }

    pub fn echo_repeated(times: usize) -> Self {
        Self::with_output(Output::EchoRepeated(times))
    }

    /// Fail with an inference error after emitting `n` pieces
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before each piece
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    fn render(&self, transcript: &Transcript) -> Vec<String> {
        match &self.output {
            Output::Pieces(pieces) => pieces.clone(),
            Output::Echo => vec![transcript.to_plain_prompt()],
            Output::EchoRepeated(n) => vec![transcript.user().content.clone(); *n],
        }
    }
}

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    generations: AtomicUsize,
    live: AtomicUsize,
}

/// Loader serving scripted models keyed by path. Unknown paths fail to load.
#[derive(Clone, Default)]
pub struct MockLoader {
    scripts: Arc<HashMap<PathBuf, Script>>,
    counters: Arc<Counters>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, path: impl Into<PathBuf>, script: Script) -> Self {
        Arc::make_mut(&mut self.scripts).insert(path.into(), script);
        self
    }

    /// Successful loads so far
    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Generations that reached a model
    pub fn generation_count(&self) -> usize {
        self.counters.generations.load(Ordering::SeqCst)
    }

    /// Handles not yet dropped
    pub fn live_handles(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn load(&self, path: &Path, _params: &LoadParams) -> Result<Box<dyn ModelHandle>, EngineError> {
        let script = self
            .scripts
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::ModelLoad(format!("no such model: {}", path.display())))?;

        std::thread::sleep(script.load_delay);
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockHandle {
            path: path.to_path_buf(),
            script,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockHandle {
    path: PathBuf,
    script: Script,
    counters: Arc<Counters>,
}

impl ModelHandle for MockHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn generate(
        &mut self,
        transcript: &Transcript,
        _sampling: &SamplingConfig,
        sink: &mut FragmentSink<'_>,
    ) -> Result<(), EngineError> {
        self.counters.generations.fetch_add(1, Ordering::SeqCst);

        for (i, piece) in self.script.render(transcript).iter().enumerate() {
            if self.script.fail_after == Some(i) {
                return Err(EngineError::Inference("scripted failure".to_string()));
            }
            std::thread::sleep(self.script.delay);
            if let ControlFlow::Break(()) = sink(piece.as_str()) {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}
