//! Scripted in-memory engine for tests.
//!
//! Every engine call is appended to a shared [`EngineLog`], which lets tests
//! assert on call order, serialization and release order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::inference::config::SessionConfig;
use crate::inference::engine::{DecodeBatch, Engine, EngineError, EngineHandle, TokenId};

pub(crate) const BOS_TOKEN: TokenId = 1;
pub(crate) const EOG_TOKEN: TokenId = 2;
pub(crate) const FOO_TOKEN: TokenId = 42;

/// Ordered record of engine calls, shared between clones
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineLog(Arc<Mutex<Vec<String>>>);

impl EngineLog {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadStage {
    Model,
    Context,
    Sampler,
}

/// What the fake engine does when asked
#[derive(Debug, Clone)]
pub(crate) struct FakeScript {
    samples: Vec<TokenId>,
    repeat: bool,
    vocab: HashMap<TokenId, Vec<u8>>,
    metadata: HashMap<String, String>,
    fail_load_at: Option<LoadStage>,
    decode_failure_at: Option<usize>,
    decode_delay: Duration,
    empty_tokenization: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self::end_immediately()
    }
}

impl FakeScript {
    /// Samples the same token forever
    pub(crate) fn repeating(token: TokenId) -> Self {
        let mut vocab = HashMap::new();
        vocab.insert(FOO_TOKEN, b"foo".to_vec());
        Self {
            samples: vec![token],
            repeat: true,
            vocab,
            metadata: HashMap::new(),
            fail_load_at: None,
            decode_failure_at: None,
            decode_delay: Duration::ZERO,
            empty_tokenization: false,
        }
    }

    /// Samples end-of-generation first
    pub(crate) fn end_immediately() -> Self {
        let mut script = Self::repeating(EOG_TOKEN);
        script.repeat = false;
        script
    }

    /// Samples one token per text piece, then end-of-generation
    pub(crate) fn sequence(pieces: &[&str]) -> Self {
        let pieces: Vec<&[u8]> = pieces.iter().map(|p| p.as_bytes()).collect();
        Self::byte_sequence(&pieces)
    }

    /// Like [`FakeScript::sequence`], with raw token bytes
    pub(crate) fn byte_sequence(pieces: &[&[u8]]) -> Self {
        let mut script = Self::end_immediately();
        script.samples = (0..pieces.len()).map(|i| 200 + i as TokenId).collect();
        for (id, piece) in script.samples.iter().zip(pieces) {
            script.vocab.insert(*id, piece.to_vec());
        }
        script
    }

    pub(crate) fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn with_load_failure(mut self, stage: LoadStage) -> Self {
        self.fail_load_at = Some(stage);
        self
    }

    /// Fails the n-th decode call (0 = prompt decode)
    pub(crate) fn with_decode_failure_at(mut self, call: usize) -> Self {
        self.decode_failure_at = Some(call);
        self
    }

    pub(crate) fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    pub(crate) fn with_empty_tokenization(mut self) -> Self {
        self.empty_tokenization = true;
        self
    }
}

pub(crate) struct FakeEngine {
    script: FakeScript,
    log: EngineLog,
}

impl FakeEngine {
    pub(crate) fn new(script: FakeScript) -> Self {
        Self {
            script,
            log: EngineLog::default(),
        }
    }

    pub(crate) fn log(&self) -> EngineLog {
        self.log.clone()
    }
}

impl Engine for FakeEngine {
    type Handle = FakeHandle;

    fn init_backend(&self) -> Result<(), EngineError> {
        self.log.push("init backend");
        Ok(())
    }

    fn load(&mut self, path: &Path, config: &SessionConfig) -> Result<FakeHandle, EngineError> {
        let fail = |stage: LoadStage| self.script.fail_load_at == Some(stage);

        self.log.push(format!("load model {}", path.display()));
        if fail(LoadStage::Model) {
            return Err(EngineError::ModelLoadFailed("fake model load failure".into()));
        }
        let model = Resource::new("model", &self.log);

        self.log.push(format!(
            "create context n_ctx={} n_batch={} threads={}",
            config.context_size, config.batch_size, config.thread_count
        ));
        if fail(LoadStage::Context) {
            return Err(EngineError::ModelLoadFailed("fake context failure".into()));
        }
        let context = Resource::new("context", &self.log);

        self.log.push("create sampler top_k top_p temp dist");
        if fail(LoadStage::Sampler) {
            return Err(EngineError::ModelLoadFailed("fake sampler failure".into()));
        }
        let sampler = Resource::new("sampler", &self.log);

        Ok(FakeHandle {
            script: self.script.clone(),
            log: self.log.clone(),
            cursor: 0,
            decodes: 0,
            prompt: Mutex::new(String::new()),
            batches: Vec::new(),
            sampler,
            context,
            model,
        })
    }
}

/// Logs its own release
struct Resource {
    name: &'static str,
    log: EngineLog,
}

impl Resource {
    fn new(name: &'static str, log: &EngineLog) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.log.push(format!("free {}", self.name));
    }
}

/// Contents of a batch at the time it was decoded
#[derive(Debug, Clone, Default)]
pub(crate) struct BatchSnapshot {
    entries: Vec<(TokenId, i32, bool)>,
}

impl BatchSnapshot {
    pub(crate) fn positions(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.1).collect()
    }

    pub(crate) fn logits(&self) -> Vec<bool> {
        self.entries.iter().map(|e| e.2).collect()
    }
}

/// Scratch batch that logs "free batch" when dropped
pub(crate) struct FakeBatch {
    entries: Vec<(TokenId, i32, bool)>,
    _release: Resource,
}

impl DecodeBatch for FakeBatch {
    fn clear(&mut self) {
        self.entries.clear();
    }

    fn add(
        &mut self,
        token: TokenId,
        position: i32,
        _sequence_ids: &[i32],
        logits: bool,
    ) -> Result<(), EngineError> {
        self.entries.push((token, position, logits));
        Ok(())
    }

    fn n_tokens(&self) -> i32 {
        self.entries.len() as i32
    }
}

pub(crate) struct FakeHandle {
    script: FakeScript,
    log: EngineLog,
    cursor: usize,
    decodes: usize,
    // Last tokenized text, tags later log entries
    prompt: Mutex<String>,
    batches: Vec<BatchSnapshot>,
    // Declaration order is release order.
    #[allow(dead_code)]
    sampler: Resource,
    #[allow(dead_code)]
    context: Resource,
    #[allow(dead_code)]
    model: Resource,
}

impl FakeHandle {
    pub(crate) fn batches(&self) -> &[BatchSnapshot] {
        &self.batches
    }

    pub(crate) fn log(&self) -> &EngineLog {
        &self.log
    }
}

impl EngineHandle for FakeHandle {
    type Batch = FakeBatch;

    fn new_batch(&self, capacity: usize) -> FakeBatch {
        FakeBatch {
            entries: Vec::with_capacity(capacity),
            _release: Resource::new("batch", &self.log),
        }
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, EngineError> {
        self.log.push(format!("tokenize {text}"));
        *self.prompt.lock().unwrap() = text.to_string();
        if self.script.empty_tokenization {
            return Ok(Vec::new());
        }
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend((0..text.split_whitespace().count()).map(|i| 100 + i as TokenId));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.script
            .vocab
            .get(&token)
            .cloned()
            .ok_or_else(|| EngineError::Tokenization(format!("unknown token {token}")))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn chat_prompt(&self, user_message: &str) -> Result<String, EngineError> {
        Ok(format!("<user>{user_message}</user>"))
    }

    fn clear_kv_cache(&mut self) {
        self.log.push("clear kv cache");
    }

    fn decode(&mut self, batch: &mut FakeBatch) -> Result<(), EngineError> {
        let call = self.decodes;
        self.decodes += 1;
        self.log.push(format!("decode {}", self.prompt.lock().unwrap()));
        if !self.script.decode_delay.is_zero() {
            thread::sleep(self.script.decode_delay);
        }
        if self.script.decode_failure_at == Some(call) {
            return Err(EngineError::Decode("fake decode status 1".into()));
        }
        self.batches.push(BatchSnapshot {
            entries: batch.entries.clone(),
        });
        Ok(())
    }

    fn reset_sampler(&mut self) {
        self.cursor = 0;
        self.log.push("reset sampler");
    }

    fn sample(&mut self, _index: i32) -> TokenId {
        self.log.push(format!("sample {}", self.prompt.lock().unwrap()));
        let token = match self.script.samples.get(self.cursor) {
            Some(token) => *token,
            None if self.script.repeat && !self.script.samples.is_empty() => {
                self.script.samples[self.cursor % self.script.samples.len()]
            }
            None => EOG_TOKEN,
        };
        self.cursor += 1;
        token
    }

    fn metadata(&self, key: &str) -> Option<String> {
        self.script.metadata.get(key).cloned()
    }

    fn parameter_count(&self) -> u64 {
        1_000_000
    }

    fn trained_context_length(&self) -> u32 {
        4096
    }

    fn vocab_size(&self) -> u32 {
        32000
    }
}

