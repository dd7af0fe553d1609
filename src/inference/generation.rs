//! Token generation loop
//!
//! Runs on the session's worker thread. One call covers one request:
//! tokenize, decode the prompt, then sample and decode one token at a time
//! until the engine signals end of generation, a stop sequence shows up, the
//! token budget is spent, or the consumer cancels.

use std::sync::Arc;

use crate::inference::config::SessionConfig;
use crate::inference::engine::{DecodeBatch, EngineError, EngineHandle};
use crate::inference::streaming::{Token, TokenSink};

/// Everything the loop needs to know about one request
#[derive(Debug, Clone)]
pub(crate) struct GenerationRequest {
    pub prompt: String,
    pub config: Arc<SessionConfig>,
}

/// Why a generation finished cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishReason {
    EndOfGeneration,
    StopSequence,
    MaxTokens,
}

/// Runs one generation, pushing tokens into `sink`.
///
/// Returns the number of emitted tokens alongside the finish reason. Errors
/// abort only this generation; the handle stays loaded.
pub(crate) fn run_generation<H: EngineHandle>(
    handle: &mut H,
    request: &GenerationRequest,
    sink: &TokenSink,
) -> Result<(FinishReason, u32), EngineError> {
    let config = &request.config;

    let prompt = if config.use_chat_template {
        match handle.chat_prompt(&request.prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                request.prompt.clone()
            }
        }
    } else {
        request.prompt.clone()
    };

    let prompt_tokens = handle.tokenize(&prompt, true)?;
    if prompt_tokens.is_empty() {
        return Err(EngineError::InvalidPrompt);
    }
    tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());
    sink.checkpoint()?;

    // Contexts are reused across requests, so start from an empty cache.
    handle.clear_kv_cache();

    let batch_size = config.batch_size.max(1) as usize;
    let mut batch = handle.new_batch(batch_size);
    let last = prompt_tokens.len() - 1;

    for (chunk_index, chunk) in prompt_tokens.chunks(batch_size).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let position = chunk_index * batch_size + offset;
            batch.add(*token, position as i32, &[0], position == last)?;
        }
        handle.decode(&mut batch)?;
        sink.checkpoint()?;
    }

    let mut position = prompt_tokens.len() as i32;
    let mut emitted = 0u32;
    let mut utf8_buffer = Utf8Buffer::default();

    handle.reset_sampler();

    while emitted < config.max_tokens {
        sink.checkpoint()?;

        let token = handle.sample(batch.n_tokens() - 1);

        if handle.is_end_of_generation(token) {
            tracing::debug!("End of generation token encountered");
            if !utf8_buffer.is_empty() {
                tracing::debug!("Dropping incomplete UTF-8 sequence at end of generation");
            }
            return Ok((FinishReason::EndOfGeneration, emitted));
        }

        let text = utf8_buffer.push(&handle.token_to_bytes(token)?);
        if let Some(stop) = first_stop_match(&text, &config.stop_sequences) {
            tracing::debug!("Stop sequence {stop:?} found in token {token}");
            return Ok((FinishReason::StopSequence, emitted));
        }

        sink.emit(Token {
            text,
            id: token,
            probability: None,
        })?;
        sink.checkpoint()?;

        batch.clear();
        batch.add(token, position, &[0], true)?;
        handle.decode(&mut batch)?;

        position += 1;
        emitted += 1;
    }

    if !utf8_buffer.is_empty() {
        tracing::debug!("Dropping incomplete UTF-8 sequence at end of generation");
    }

    Ok((FinishReason::MaxTokens, emitted))
}

/// First configured stop sequence contained in `text`.
///
/// Plain substring match, checked in configuration order. Empty stop
/// sequences never match.
pub(crate) fn first_stop_match<'a>(text: &str, stop_sequences: &'a [String]) -> Option<&'a str> {
    if text.is_empty() {
        return None;
    }
    stop_sequences
        .iter()
        .map(String::as_str)
        .find(|stop| !stop.is_empty() && text.contains(stop))
}

/// Carries incomplete UTF-8 sequences across token boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Appends `bytes` and returns the longest valid UTF-8 prefix.
    ///
    /// An incomplete trailing sequence stays buffered. Bytes that can never
    /// become valid are replaced with U+FFFD.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
