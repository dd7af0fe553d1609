//! llama-session
//!
//! Streaming inference sessions over llama.cpp: load a GGUF model, generate
//! text in one shot or as a token stream, and release the model when done.

#![cfg_attr(
    feature = "llama",
    doc = r#"
```no_run
# async fn demo() -> Result<(), llama_session::EngineError> {
use futures::StreamExt;
use llama_session::{LlamaCppEngine, Session, SessionConfig};

let session = Session::new(LlamaCppEngine::new(), "models/tiny.gguf", SessionConfig::default())?;
session.load().await?;

let mut stream = session.stream("Once upon a time")?;
while let Some(token) = stream.next().await {
    print!("{}", token?.text);
}
# Ok(())
# }
```
"#
)]

pub mod inference;
pub mod storage;
pub mod telemetry;

pub use inference::{
    Engine, EngineError, EngineHandle, ModelInfo, Response, Session, SessionConfig, Token,
    TokenStream,
};
#[cfg(feature = "llama")]
pub use inference::{LlamaCppEngine, LlamaSession};
