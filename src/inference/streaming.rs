//! Streaming inference support
//!
//! Tokens travel from the session's worker thread to the consumer over a
//! bounded channel of capacity one. The channel closing without an error is
//! a clean finish; an `Err` item followed by the close is a failure.
//!
//! Cancellation flows the other way: dropping a [`TokenStream`] (or calling
//! [`TokenStream::cancel`]) cancels the generation's token, which the
//! producer checks between loop steps and while waiting for buffer space.

use std::pin::{pin, Pin};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, Either};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::inference::engine::{EngineError, TokenId};

/// One generated token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Text fragment for this token (may be empty while a UTF-8 sequence is incomplete)
    pub text: String,
    /// Vocabulary id
    pub id: TokenId,
    /// Sampling probability, when the engine reports one
    pub probability: Option<f32>,
}

/// Aggregate of a completed generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Concatenation of all token texts in emission order
    pub text: String,
    /// Number of tokens emitted
    pub token_count: usize,
    /// Wall-clock time of the whole generation
    pub generation_time: Duration,
}

impl Response {
    /// Tokens per second, 0 when either the count or the duration is zero
    pub fn tokens_per_second(&self) -> f64 {
        let seconds = self.generation_time.as_secs_f64();
        if self.token_count == 0 || seconds == 0.0 {
            return 0.0;
        }
        self.token_count as f64 / seconds
    }
}

type StreamItem = Result<Token, EngineError>;

/// Creates a connected producer/consumer pair.
///
/// `cancel` should be unique to this generation; the stream cancels it when
/// dropped.
pub(crate) fn token_channel(cancel: CancellationToken) -> (TokenSink, TokenStream) {
    let (tx, rx) = mpsc::channel(1);
    let sink = TokenSink {
        tx,
        cancel: cancel.clone(),
    };
    let stream = TokenStream {
        rx,
        cancel: cancel.clone(),
        _guard: cancel.drop_guard(),
    };
    (sink, stream)
}

/// Consumer side of a generation: an ordered, single-use sequence of tokens.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl TokenStream {
    /// Asks the producer to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for TokenStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer side, used by the generation loop on the worker thread.
#[derive(Debug)]
pub(crate) struct TokenSink {
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
}

impl TokenSink {
    /// Fails with [`EngineError::Cancelled`] once the consumer has gone away
    /// or cancelled
    pub(crate) fn checkpoint(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() || self.tx.is_closed() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Blocks until the consumer has room for the token.
    pub(crate) fn emit(&self, token: Token) -> Result<(), EngineError> {
        self.deliver(Ok(token))
    }

    /// Reports the error that ended this generation.
    ///
    /// A cancelled generation only reports if there is room right away, the
    /// producer never waits on a consumer after cancellation.
    pub(crate) fn fail(&self, error: EngineError) {
        let result = if self.cancel.is_cancelled() {
            self.tx.try_send(Err(error)).map_err(|_| EngineError::Cancelled)
        } else {
            self.deliver(Err(error))
        };
        if result.is_err() {
            tracing::debug!("Consumer gone before the generation error could be delivered");
        }
    }

    // Must only be called from a thread outside any async runtime.
    fn deliver(&self, item: StreamItem) -> Result<(), EngineError> {
        self.checkpoint()?;

        let cancelled = pin!(self.cancel.cancelled());
        let send = pin!(self.tx.send(item));
        match futures::executor::block_on(future::select(cancelled, send)) {
            Either::Left(_) => Err(EngineError::Cancelled),
            Either::Right((Ok(()), _)) => Ok(()),
            Either::Right((Err(_), _)) => Err(EngineError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::thread;

    fn token(text: &str, id: TokenId) -> Token {
        Token {
            text: text.to_string(),
            id,
            probability: None,
        }
    }

    #[test]
    fn test_tokens_per_second_zero_cases() {
        let response = Response {
            text: String::new(),
            token_count: 0,
            generation_time: Duration::from_secs(2),
        };
        assert_eq!(response.tokens_per_second(), 0.0);

        let response = Response {
            text: "abc".to_string(),
            token_count: 3,
            generation_time: Duration::ZERO,
        };
        assert_eq!(response.tokens_per_second(), 0.0);

        let response = Response {
            text: "abcd".to_string(),
            token_count: 4,
            generation_time: Duration::from_secs(2),
        };
        assert!((response.tokens_per_second() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stream_delivers_in_order_then_closes() {
        let (sink, mut stream) = token_channel(CancellationToken::new());

        let producer = thread::spawn(move || {
            for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
                sink.emit(token(text, i as TokenId)).unwrap();
            }
        });

        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            texts.push(item.unwrap().text);
        }
        producer.join().unwrap();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stream_reports_failure() {
        let (sink, mut stream) = token_channel(CancellationToken::new());

        let producer = thread::spawn(move || {
            sink.emit(token("a", 1)).unwrap();
            sink.fail(EngineError::Decode("status 1".into()));
        });

        assert_eq!(stream.next().await.unwrap().unwrap().text, "a");
        assert!(matches!(
            stream.next().await,
            Some(Err(EngineError::Decode(_)))
        ));
        assert!(stream.next().await.is_none());
        producer.join().unwrap();
    }

    #[test]
    fn test_drop_cancels_blocked_producer() {
        let cancel = CancellationToken::new();
        let (sink, stream) = token_channel(cancel.clone());

        // Fill the single slot so the next emit has to wait.
        sink.emit(token("a", 1)).unwrap();
        let producer = thread::spawn(move || sink.emit(token("b", 2)));

        drop(stream);
        assert!(cancel.is_cancelled());
        assert_eq!(producer.join().unwrap(), Err(EngineError::Cancelled));
    }

    #[test]
    fn test_explicit_cancel_stops_checkpoint() {
        let (sink, stream) = token_channel(CancellationToken::new());
        assert!(sink.checkpoint().is_ok());

        stream.cancel();
        assert!(stream.is_cancelled());
        assert_eq!(sink.checkpoint(), Err(EngineError::Cancelled));
    }
}
