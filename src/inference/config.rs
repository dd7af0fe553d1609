//! Session configuration
//!
//! Sampling, context and threading parameters for a session. A configuration
//! is validated once, when the session is constructed, and is immutable from
//! then on.

use serde::{Deserialize, Serialize};

use crate::inference::engine::EngineError;

/// Configuration for a [`Session`](crate::inference::Session)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of CPU threads used for decoding
    pub thread_count: i32,
    /// Maximum number of tokens to generate per request
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Context window size in tokens
    pub context_size: u32,
    /// Maximum number of prompt tokens submitted in one decode call
    pub batch_size: u32,
    /// Offload all layers to the accelerator
    pub use_accelerator: bool,
    /// Generation stops when a token's text contains any of these
    pub stop_sequences: Vec<String>,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// Wrap the prompt with the model's chat template before tokenizing
    pub use_chat_template: bool,
}

impl SessionConfig {
    /// Small context, few threads, CPU only.
    pub const LOW_RESOURCE: SessionConfig = SessionConfig {
        thread_count: 2,
        max_tokens: 256,
        temperature: 0.7,
        top_p: 0.9,
        top_k: 40,
        context_size: 1024,
        batch_size: 128,
        use_accelerator: false,
        stop_sequences: Vec::new(),
        seed: 0,
        use_chat_template: false,
    };

    /// Large context and batches, all layers offloaded.
    pub const HIGH_PERFORMANCE: SessionConfig = SessionConfig {
        thread_count: 8,
        max_tokens: 2048,
        temperature: 0.8,
        top_p: 0.95,
        top_k: 40,
        context_size: 8192,
        batch_size: 1024,
        use_accelerator: true,
        stop_sequences: Vec::new(),
        seed: 0,
        use_chat_template: false,
    };

    /// For constrained or sandboxed environments: one thread, tiny context.
    pub const SANDBOXED: SessionConfig = SessionConfig {
        thread_count: 1,
        max_tokens: 128,
        temperature: 0.7,
        top_p: 0.9,
        top_k: 20,
        context_size: 512,
        batch_size: 64,
        use_accelerator: false,
        stop_sequences: Vec::new(),
        seed: 0,
        use_chat_template: false,
    };

    /// Checks every numeric invariant
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.thread_count <= 0 {
            return Err(invalid(format!(
                "thread count must be positive, got {}",
                self.thread_count
            )));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max tokens must be positive".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid(format!(
                "temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(invalid(format!(
                "top-p must be within 0.0..=1.0, got {}",
                self.top_p
            )));
        }
        if self.context_size == 0 {
            return Err(invalid("context size must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_thread_count(mut self, thread_count: i32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_accelerator(mut self, use_accelerator: bool) -> Self {
        self.use_accelerator = use_accelerator;
        self
    }

    pub fn with_stop_sequences<I, S>(mut self, stop_sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stop_sequences.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().min(8) as i32)
            .unwrap_or(4);

        Self {
            thread_count: threads,
            max_tokens: 512,
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            context_size: 2048,
            batch_size: 512,
            use_accelerator: cfg!(any(
                feature = "cuda",
                feature = "vulkan",
                feature = "metal",
                target_os = "macos"
            )),
            stop_sequences: Vec::new(),
            seed: 0,
            use_chat_template: false,
        }
    }
}

fn invalid(reason: String) -> EngineError {
    EngineError::InvalidConfiguration(reason)
}
