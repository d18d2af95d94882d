//! llama.cpp backend
//!
//! Loads GGUF weights through `llama-cpp-2` and runs token-by-token
//! generation for one transcript at a time.
//!
//! A `LlamaContext` borrows the `LlamaModel` it was created from, so the
//! per-generation context (and its KV cache) is built inside
//! [`ModelHandle::generate`] and is always dropped before the weights.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{FragmentSink, ModelHandle, ModelLoader};
use crate::inference::config::{LoadParams, SamplingConfig};
use crate::inference::engine::EngineError;
use crate::inference::model::validate_gguf;
use crate::types::Transcript;

/// Minimum decode batch size
const MIN_BATCH: usize = 512;

/// Tokens considered by the repetition penalty
const PENALTY_LAST_N: i32 = 64;

static BACKEND: OnceLock<LlamaBackend> = OnceLock::new();
static BACKEND_INIT: Mutex<()> = Mutex::new(());

/// The llama.cpp backend may only be initialized once per process.
fn shared_backend() -> Result<&'static LlamaBackend, EngineError> {
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }

    let _init = BACKEND_INIT
        .lock()
        .map_err(|_| EngineError::Worker("backend init lock poisoned".to_string()))?;
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }

    let backend = LlamaBackend::init()
        .map_err(|e| EngineError::ModelLoad(format!("Failed to initialize backend: {e}")))?;
    tracing::info!("LlamaBackend initialized");
    Ok(BACKEND.get_or_init(|| backend))
}

/// Loads GGUF models with llama.cpp
pub struct LlamaLoader {
    backend: &'static LlamaBackend,
}

impl LlamaLoader {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            backend: shared_backend()?,
        })
    }
}

impl ModelLoader for LlamaLoader {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Box<dyn ModelHandle>, EngineError> {
        if !path.is_file() {
            return Err(EngineError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        // Cheap header check before llama.cpp maps the whole file
        let header = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} header ok for {:?} ({} tensors)",
            header.version,
            path,
            header.tensor_count
        );

        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(self.backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model info: {} ({} params, {} vocab, {} ctx)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(Box::new(LlamaHandle {
            path: path.to_path_buf(),
            model,
            backend: self.backend,
            params: *params,
        }))
    }
}

/// Loaded llama.cpp weights
struct LlamaHandle {
    path: PathBuf,
    model: LlamaModel,
    backend: &'static LlamaBackend,
    params: LoadParams,
}

impl ModelHandle for LlamaHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn generate(
        &mut self,
        transcript: &Transcript,
        sampling: &SamplingConfig,
        sink: &mut FragmentSink<'_>,
    ) -> Result<(), EngineError> {
        let prompt = self.render_prompt(transcript);

        let train_ctx = self.model.n_ctx_train();
        let n_ctx = if train_ctx == 0 {
            self.params.context_size
        } else {
            self.params.context_size.min(train_ctx)
        };
        let n_ctx = NonZeroU32::new(n_ctx)
            .ok_or_else(|| EngineError::Inference("context size is zero".to_string()))?;

        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::Inference(format!("Failed to tokenize: {e}")))?;
        if tokens.is_empty() {
            return Err(EngineError::InvalidRequest("prompt produced no tokens".to_string()));
        }
        if tokens.len() >= n_ctx.get() as usize {
            return Err(EngineError::InvalidRequest(format!(
                "prompt is {} tokens, context window is {}",
                tokens.len(),
                n_ctx
            )));
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        let n_batch = tokens.len().max(MIN_BATCH);
        let threads = self.params.threads as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_batch as u32)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let mut ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| EngineError::Inference(format!("Failed to create context: {e}")))?;

        run_inference(&mut ctx, &self.model, tokens, n_batch, n_ctx.get(), sampling, sink)
    }
}

impl LlamaHandle {
    /// Applies the model's chat template, falling back to plain
    /// `Role: content` lines when the model has none.
    fn render_prompt(&self, transcript: &Transcript) -> String {
        match self.apply_chat_template(transcript) {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                transcript.to_plain_prompt()
            }
        }
    }

    fn apply_chat_template(&self, transcript: &Transcript) -> Result<String, String> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|e| format!("Failed to load chat template: {e}"))?;
        let messages = transcript
            .messages()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Failed to build chat message: {e}"))?;
        self.model
            .apply_chat_template(&template, &messages, true)
            .map_err(|e| format!("Failed to apply chat template: {e}"))
    }
}

/// Decodes the prompt, then samples until end of generation, the token
/// budget, a full context window, or the sink asks to stop.
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<LlamaToken>,
    n_batch: usize,
    n_ctx: u32,
    sampling: &SamplingConfig,
    sink: &mut FragmentSink<'_>,
) -> Result<(), EngineError> {
    let mut batch = LlamaBatch::new(n_batch, 1);

    let last = prompt_tokens.len() - 1;
    for (i, token) in prompt_tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("Failed to decode prompt: {e}")))?;

    let mut sampler = build_sampler(sampling);
    let mut n_cur = prompt_tokens.len() as i32;

    // Bytes of a character split across tokens
    let mut pending: Vec<u8> = Vec::new();

    for _ in 0..sampling.max_tokens {
        if n_cur as u32 >= n_ctx {
            tracing::debug!("Context window full after {} tokens", n_cur);
            break;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("Failed to convert token to bytes: {e}")))?;
        pending.extend_from_slice(&bytes);

        let text = take_utf8(&mut pending);
        if !text.is_empty() && sink(text.as_str()).is_break() {
            return Ok(());
        }

        batch.clear();
        batch
            .add(token, n_cur, &[0], true)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("Failed to decode: {e}")))?;

        n_cur += 1;
    }

    if !pending.is_empty() {
        let rest = String::from_utf8_lossy(&pending).into_owned();
        let _ = sink(rest.as_str());
    }

    Ok(())
}

/// Sampler chain: repetition penalty, then top-k, top-p and temperature.
/// Near-zero temperature switches to greedy decoding.
fn build_sampler(sampling: &SamplingConfig) -> LlamaSampler {
    let seed = if sampling.seed == 0 {
        rand_seed()
    } else {
        sampling.seed
    };
    let penalties = LlamaSampler::penalties(PENALTY_LAST_N, sampling.repeat_penalty, 0.0, 0.0);

    if sampling.temperature < 0.01 {
        LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()])
    } else {
        LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::top_k(sampling.top_k as i32),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(seed),
        ])
    }
}

/// Takes the longest valid UTF-8 prefix out of `pending`, leaving an
/// incomplete trailing character behind. Bytes that can never become valid
/// are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_some() => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
        Err(e) => {
            let rest = pending.split_off(e.valid_up_to());
            let head = std::mem::replace(pending, rest);
            String::from_utf8(head).unwrap_or_default()
        }
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_take_utf8_complete() {
        let mut pending = "héllo".as_bytes().to_vec();
        assert_eq!(take_utf8(&mut pending), "héllo");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_utf8_keeps_split_character() {
        let snowman = "☃".as_bytes();
        let mut pending = b"a".to_vec();
        pending.extend_from_slice(&snowman[..2]);

        assert_eq!(take_utf8(&mut pending), "a");
        assert_eq!(pending, snowman[..2].to_vec());

        pending.extend_from_slice(&snowman[2..]);
        assert_eq!(take_utf8(&mut pending), "☃");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_utf8_replaces_invalid_bytes() {
        let mut pending = vec![b'o', b'k', 0xFF];
        assert_eq!(take_utf8(&mut pending), "ok\u{FFFD}");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_loader_rejects_missing_file() {
        let loader = LlamaLoader::new().unwrap();
        let params = LoadParams {
            context_size: 512,
            threads: 1,
            gpu_layers: 0,
        };
        let result = loader.load(Path::new("/this/path/does/not/exist.gguf"), &params);
        assert!(matches!(result, Err(EngineError::ModelLoad(_))));
    }

    #[test]
    fn test_loader_rejects_non_gguf() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(b"definitely not a model file").unwrap();
        file.flush().unwrap();

        let loader = LlamaLoader::new().unwrap();
        let params = LoadParams {
            context_size: 512,
            threads: 1,
            gpu_layers: 0,
        };
        let result = loader.load(file.path(), &params);
        assert!(matches!(result, Err(EngineError::ModelLoad(_))));
    }
}
