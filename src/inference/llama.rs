//! llama.cpp engine
//!
//! [`Engine`] implementation on top of `llama-cpp-2`.
//!
//! # Threading
//!
//! `LlamaContext` and `LlamaSampler` contain raw pointers that are not
//! `Send`. A [`LlamaHandle`] is therefore created and used only on the
//! session's worker thread; only the [`LlamaCppEngine`] itself crosses
//! threads.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, DecodeError, LogOptions};
use once_cell::sync::OnceCell;

use crate::inference::config::SessionConfig;
use crate::inference::engine::{DecodeBatch, Engine, EngineError, EngineHandle, TokenId};
use crate::inference::model::validate_gguf;

/// Layer count large enough to offload every layer of any model
const ALL_GPU_LAYERS: u32 = 999;

/// Process-wide llama.cpp backend, initialized at most once
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::ModelLoadFailed(format!("backend init: {e}")))?;
        tracing::info!("LlamaBackend initialized");
        Ok(backend)
    })
}

/// The llama.cpp inference engine
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaCppEngine;

impl LlamaCppEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for LlamaCppEngine {
    type Handle = LlamaHandle;

    fn init_backend(&self) -> Result<(), EngineError> {
        backend().map(|_| ())
    }

    fn load(&mut self, path: &Path, config: &SessionConfig) -> Result<LlamaHandle, EngineError> {
        let backend = backend()?;

        let header = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} header ok: {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        if config.use_accelerator && !backend.supports_gpu_offload() {
            return Err(EngineError::AcceleratorUnavailable);
        }

        let gpu_layers = if config.use_accelerator {
            ALL_GPU_LAYERS
        } else {
            0
        };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoadFailed(e.to_string()))?;
        let model = Box::new(model);

        let n_ctx = NonZeroU32::new(config.context_size).ok_or_else(|| {
            EngineError::InvalidConfiguration("context size must be positive".into())
        })?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.batch_size)
            .with_n_threads(config.thread_count)
            .with_n_threads_batch(config.thread_count);

        // On failure `model` is dropped here, releasing it before the error
        // reaches the caller.
        let context = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ModelLoadFailed(format!("Failed to create context: {e}")))?;

        // SAFETY: the context borrows the boxed model, whose heap address is
        // stable for the handle's lifetime. `LlamaHandle` declares `context`
        // before `model`, so the context is always dropped first.
        let context = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(context) };

        let seed = if config.seed == 0 {
            rand_seed()
        } else {
            config.seed
        };
        let sampler = LlamaSampler::chain_simple([
            LlamaSampler::top_k(top_k_param(config.top_k)),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(seed),
        ]);

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx, {} gpu layers)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            config.context_size,
            gpu_layers
        );

        Ok(LlamaHandle {
            sampler,
            context,
            model,
        })
    }
}

/// A loaded llama.cpp model with its context and sampler chain.
///
/// Fields drop in declaration order: sampler, context, model.
pub struct LlamaHandle {
    sampler: LlamaSampler,
    context: LlamaContext<'static>,
    model: Box<LlamaModel>,
}

impl Drop for LlamaHandle {
    fn drop(&mut self) {
        tracing::debug!("Releasing sampler, context and model");
    }
}

/// Scratch decode batch for one generation
pub struct LlamaDecodeBatch(LlamaBatch);

impl DecodeBatch for LlamaDecodeBatch {
    fn clear(&mut self) {
        self.0.clear();
    }

    fn add(
        &mut self,
        token: TokenId,
        position: i32,
        sequence_ids: &[i32],
        logits: bool,
    ) -> Result<(), EngineError> {
        self.0
            .add(LlamaToken::new(token), position, sequence_ids, logits)
            .map_err(|e| EngineError::Decode(format!("Failed to add token to batch: {e}")))
    }

    fn n_tokens(&self) -> i32 {
        self.0.n_tokens()
    }
}

impl EngineHandle for LlamaHandle {
    type Batch = LlamaDecodeBatch;

    fn new_batch(&self, capacity: usize) -> LlamaDecodeBatch {
        LlamaDecodeBatch(LlamaBatch::new(capacity, 1))
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::Tokenization(format!("Failed to convert token to bytes: {e}")))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn chat_prompt(&self, user_message: &str) -> Result<String, EngineError> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|e| EngineError::Tokenization(format!("Failed to load chat template: {e}")))?;
        let message = LlamaChatMessage::new("user".to_string(), user_message.to_string())
            .map_err(|e| EngineError::Tokenization(format!("Failed to build chat message: {e}")))?;
        self.model
            .apply_chat_template(&template, &[message], true)
            .map_err(|e| EngineError::Tokenization(format!("Failed to apply chat template: {e}")))
    }

    fn clear_kv_cache(&mut self) {
        self.context.clear_kv_cache();
    }

    fn decode(&mut self, batch: &mut LlamaDecodeBatch) -> Result<(), EngineError> {
        self.context.decode(&mut batch.0).map_err(|e| match e {
            DecodeError::NoKvCacheSlot => {
                EngineError::ResourceExhausted("no KV cache slot available".to_string())
            }
            other => EngineError::Decode(other.to_string()),
        })
    }

    fn reset_sampler(&mut self) {
        self.sampler.reset();
    }

    fn sample(&mut self, index: i32) -> TokenId {
        self.sampler.sample(&self.context, index).0
    }

    fn metadata(&self, key: &str) -> Option<String> {
        self.model.meta_val_str(key).ok()
    }

    fn parameter_count(&self) -> u64 {
        self.model.n_params() as u64
    }

    fn trained_context_length(&self) -> u32 {
        self.model.n_ctx_train()
    }

    fn vocab_size(&self) -> u32 {
        self.model.n_vocab().max(0) as u32
    }
}

/// llama.cpp takes top-k as `i32`; larger values saturate
fn top_k_param(top_k: u32) -> i32 {
    i32::try_from(top_k).unwrap_or(i32::MAX)
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
