//! LLM inference
//!
//! Session control, the generation loop and the engine boundary. The
//! llama.cpp engine lives in [`llama`] behind the `llama` feature.

pub mod config;
pub mod engine;
mod generation;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use config::SessionConfig;
pub use engine::{DecodeBatch, Engine, EngineError, EngineHandle, TokenId};
#[cfg(feature = "llama")]
pub use llama::{LlamaCppEngine, LlamaHandle};
pub use model::{resolve_model_location, validate_gguf, GgufHeader, ModelError, ModelInfo, GGUF_MAGIC};
pub use session::Session;
pub use streaming::{Response, Token, TokenStream};

/// A session driving llama.cpp
#[cfg(feature = "llama")]
pub type LlamaSession = Session<LlamaCppEngine>;
