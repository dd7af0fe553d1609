//! Engine boundary
//!
//! The traits in this module are everything the session layer needs from an
//! inference engine. The production implementation wraps llama.cpp (see
//! [`crate::inference::llama`]); tests drive the same session code through a
//! scripted fake.
//!
//! # Ownership
//!
//! An [`EngineHandle`] owns a loaded model, its execution context and its
//! sampler chain. Dropping the handle releases all three, in that reverse
//! order. Handles are only ever touched from the session's worker thread, so
//! they do not need to be `Send`.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::inference::config::SessionConfig;
use crate::inference::model::ModelError;

/// Token identifier as understood by the engine's vocabulary
pub type TokenId = i32;

/// Errors that can occur during session and inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("No model loaded")]
    NotLoaded,

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Prompt is empty or produced no tokens")]
    InvalidPrompt,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Accelerator requested but not available")]
    AcceleratorUnavailable,

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl EngineError {
    /// Short hint shown to users next to the error message
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EngineError::ModelNotFound(_) => "Check the model file path.",
            EngineError::ModelLoadFailed(_) => {
                "Check that the file is a valid GGUF model, or try the low-resource configuration."
            }
            EngineError::NotLoaded => "Load the model before generating.",
            EngineError::Decode(_) => "Reduce the context size or the prompt length.",
            EngineError::InvalidConfiguration(_) => {
                "Start from one of the configuration presets and adjust from there."
            }
            EngineError::InvalidPrompt => "Provide a non-empty prompt.",
            EngineError::Tokenization(_) => "Check the prompt for unsupported characters.",
            EngineError::ResourceExhausted(_) => {
                "Reduce the context size or use the low-resource configuration."
            }
            EngineError::AcceleratorUnavailable => "Disable the accelerator in the configuration.",
            EngineError::Cancelled => "Start a new generation.",
            EngineError::Worker(_) => "Create a new session.",
        }
    }

    /// Returns true for the errors that belong to the model-load failure class
    ///
    /// This covers load failures proper, decode failures, and operations on
    /// a session without a loaded model.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ModelLoadFailed(_) | EngineError::NotLoaded | EngineError::Decode(_)
        )
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelLoadFailed(e.to_string())
    }
}

/// An inference engine able to produce loaded handles.
pub trait Engine: Send + 'static {
    type Handle: EngineHandle;

    /// Process-wide backend initialization.
    ///
    /// Called on every session construction; implementations must perform
    /// the actual initialization at most once per process.
    fn init_backend(&self) -> Result<(), EngineError>;

    /// Loads the model and creates its context and sampler chain.
    ///
    /// Acquisition order is model, context, sampler chain. A failure at any
    /// stage releases whatever was already acquired before returning.
    fn load(&mut self, path: &Path, config: &SessionConfig) -> Result<Self::Handle, EngineError>;
}

/// A loaded model with its execution context and sampler chain.
pub trait EngineHandle {
    type Batch: DecodeBatch;

    /// Allocates a scratch batch able to hold `capacity` token positions
    fn new_batch(&self, capacity: usize) -> Self::Batch;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of a token's text piece. May be an incomplete UTF-8 sequence.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Wraps a single user message with the model's chat template
    fn chat_prompt(&self, user_message: &str) -> Result<String, EngineError>;

    fn clear_kv_cache(&mut self);

    fn decode(&mut self, batch: &mut Self::Batch) -> Result<(), EngineError>;

    fn reset_sampler(&mut self);

    /// Samples from the logits of batch position `index` of the last decode
    fn sample(&mut self, index: i32) -> TokenId;

    /// String metadata value, `None` when the key is missing or unreadable
    fn metadata(&self, key: &str) -> Option<String>;

    fn parameter_count(&self) -> u64;

    fn trained_context_length(&self) -> u32;

    fn vocab_size(&self) -> u32;
}

/// A batch of token positions submitted to [`EngineHandle::decode`].
pub trait DecodeBatch {
    fn clear(&mut self);

    fn add(
        &mut self,
        token: TokenId,
        position: i32,
        sequence_ids: &[i32],
        logits: bool,
    ) -> Result<(), EngineError>;

    fn n_tokens(&self) -> i32;
}
