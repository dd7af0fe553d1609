//! Inference session
//!
//! A [`Session`] owns one engine handle and serializes every engine call
//! through a dedicated worker thread.
//!
//! # Architecture
//!
//! Engine handles contain raw pointers that are not `Send`, and the engine
//! is not safe to call concurrently on one handle. All engine work therefore
//! runs on a single worker thread that owns the engine and its handle and
//! processes commands one at a time, in arrival order. Callers talk to it
//! over a command channel and await replies on oneshot channels, so async
//! callers never block their runtime while the worker is busy.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inference::config::SessionConfig;
use crate::inference::engine::{Engine, EngineError};
use crate::inference::generation::{run_generation, GenerationRequest};
use crate::inference::model::{resolve_model_location, ModelInfo};
use crate::inference::streaming::{token_channel, Response, TokenSink, TokenStream};

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        response_tx: oneshot::Sender<Result<(), EngineError>>,
    },
    Unload {
        done_tx: Sender<()>,
    },
    Generate {
        request_id: Uuid,
        request: GenerationRequest,
        sink: TokenSink,
    },
    ModelInfo {
        response_tx: oneshot::Sender<Option<ModelInfo>>,
    },
    Shutdown,
}

/// A single-model inference session
///
/// Construction validates the configuration and the model location but does
/// not load anything; call [`Session::load`] for that. Dropping the session
/// releases the model if it is still loaded.
pub struct Session<E: Engine> {
    model_path: PathBuf,
    config: Arc<SessionConfig>,
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Mirrors whether the worker currently holds a handle
    loaded: Arc<AtomicBool>,
    /// Parent of every generation's cancellation token; replaced on unload
    generations: Mutex<CancellationToken>,
    _engine: PhantomData<fn() -> E>,
}

impl<E: Engine> Session<E> {
    /// Creates a session for the model at `model_location`.
    ///
    /// `model_location` is a file path or a `file://` URL.
    pub fn new<P: AsRef<Path>>(
        engine: E,
        model_location: P,
        config: SessionConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let model_path = resolve_model_location(model_location)?;

        engine.init_backend()?;

        let config = Arc::new(config);
        let loaded = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let worker_path = model_path.clone();
        let worker_config = Arc::clone(&config);
        let worker_loaded = Arc::clone(&loaded);
        let handle = thread::Builder::new()
            .name("inference-session".into())
            .spawn(move || {
                worker_thread_main(engine, worker_path, worker_config, worker_loaded, command_rx);
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        tracing::info!("Session created for {}", model_path.display());

        Ok(Self {
            model_path,
            config,
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            loaded,
            generations: Mutex::new(CancellationToken::new()),
            _engine: PhantomData,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns true if a model is currently loaded
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Loads the model, its context and its sampler chain.
    ///
    /// Fails with [`EngineError::InvalidConfiguration`] if the model is
    /// already loaded.
    pub async fn load(&self) -> Result<(), EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::Load { response_tx })?;

        response_rx
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }

    /// Releases the sampler, context and model, in that order.
    ///
    /// Blocks until the worker has finished any in-flight work. Running or
    /// queued generations are cancelled at their next checkpoint, so a
    /// `generate()` or `stream()` started before this call can end with
    /// [`EngineError::Cancelled`]. Safe to call when nothing is loaded.
    pub fn unload(&self) {
        self.cancel_generations();

        let (done_tx, done_rx) = mpsc::channel();
        if self.send(WorkerCommand::Unload { done_tx }).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Generates a complete response for `prompt`.
    pub async fn generate(&self, prompt: &str) -> Result<Response, EngineError> {
        let start = Instant::now();
        let mut stream = self.stream(prompt)?;

        let mut text = String::new();
        let mut token_count = 0;
        while let Some(token) = stream.next().await {
            let token = token?;
            text.push_str(&token.text);
            token_count += 1;
        }

        let response = Response {
            text,
            token_count,
            generation_time: start.elapsed(),
        };
        tracing::info!(
            "Generated {} tokens in {:.2}s ({:.1} tok/s)",
            response.token_count,
            response.generation_time.as_secs_f64(),
            response.tokens_per_second()
        );
        Ok(response)
    }

    /// Starts a generation and returns its token stream right away.
    ///
    /// Tokens are produced on the worker thread while the caller iterates.
    /// Dropping the stream cancels the generation.
    pub fn stream(&self, prompt: &str) -> Result<TokenStream, EngineError> {
        if prompt.is_empty() {
            return Err(EngineError::InvalidPrompt);
        }
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }

        let cancel = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .child_token();
        let (sink, stream) = token_channel(cancel);

        self.send(WorkerCommand::Generate {
            request_id: Uuid::new_v4(),
            request: GenerationRequest {
                prompt: prompt.to_string(),
                config: Arc::clone(&self.config),
            },
            sink,
        })?;

        Ok(stream)
    }

    /// Returns metadata about the loaded model, `None` when unloaded
    pub async fn model_info(&self) -> Option<ModelInfo> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::ModelInfo { response_tx }).ok()?;
        response_rx.await.ok().flatten()
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| EngineError::Worker("worker thread stopped".into()))?;
        command_tx
            .send(command)
            .map_err(|e| EngineError::Worker(e.to_string()))
    }

    fn cancel_generations(&self) {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *generations, CancellationToken::new()).cancel();
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        self.cancel_generations();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the engine and its handle, processes commands in arrival order.
fn worker_thread_main<E: Engine>(
    mut engine: E,
    model_path: PathBuf,
    config: Arc<SessionConfig>,
    loaded: Arc<AtomicBool>,
    command_rx: Receiver<WorkerCommand>,
) {
    let mut handle: Option<E::Handle> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { response_tx }) => {
                let result = if handle.is_some() {
                    Err(EngineError::InvalidConfiguration(
                        "model is already loaded".into(),
                    ))
                } else {
                    engine.load(&model_path, &config).map(|h| {
                        handle = Some(h);
                        loaded.store(true, Ordering::Release);
                    })
                };
                if let Err(e) = &result {
                    tracing::error!("Failed to load {}: {}", model_path.display(), e);
                }
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Unload { done_tx }) => {
                if handle.take().is_some() {
                    tracing::info!("Model unloaded");
                }
                loaded.store(false, Ordering::Release);
                let _ = done_tx.send(());
            }
            Ok(WorkerCommand::Generate {
                request_id,
                request,
                sink,
            }) => match handle.as_mut() {
                Some(h) => {
                    let span = tracing::debug_span!("generation", %request_id);
                    let _enter = span.enter();
                    match run_generation(h, &request, &sink) {
                        Ok((reason, emitted)) => {
                            tracing::debug!("Generation finished ({reason:?}) after {emitted} tokens");
                        }
                        Err(EngineError::Cancelled) => {
                            tracing::debug!("Generation cancelled");
                            sink.fail(EngineError::Cancelled);
                        }
                        Err(e) => {
                            tracing::error!("Generation failed: {}", e);
                            sink.fail(e);
                        }
                    }
                }
                None => sink.fail(EngineError::NotLoaded),
            },
            Ok(WorkerCommand::ModelInfo { response_tx }) => {
                let _ = response_tx.send(handle.as_ref().map(ModelInfo::query));
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }

    if handle.take().is_some() {
        tracing::info!("Model released on session teardown");
    }
}
