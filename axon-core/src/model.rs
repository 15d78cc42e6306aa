//! The model-client contract: blocking and streaming generation.
//!
//! Wire clients live outside this crate. What the engine requires of them
//! is the [`ModelClient`] trait plus one discipline: every implementation
//! publishes `BeforeModelCall` / `AfterModelCall` on the supplied
//! execution context, which is what keeps token stats current for both
//! loop calls and compaction's summarization calls.

use crate::context::ExecutionContext;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Token usage from a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
}

/// One response alternative from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChoice {
    /// The response text.
    pub content: String,
}

/// A complete model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The model that produced the response.
    pub model: String,
    /// Response alternatives. Usually exactly one.
    pub choices: Vec<ModelChoice>,
    /// Token usage for the call.
    pub usage: TokenUsage,
}

impl ModelResponse {
    /// The first choice's content, if any choice exists.
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.content.as_str())
    }
}

/// Per-call generation options.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Model override (None = client default).
    pub model: Option<String>,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
}

/// Errors from model clients.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ModelError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The client was rate-limited.
    #[error("rate limited")]
    RateLimited,

    /// Authentication/authorization failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// The client could not parse the backend's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The ambient cancellation signal fired during the call.
    #[error("cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ModelError {
    /// Whether retrying this request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::RateLimited | ModelError::RequestFailed(_))
    }
}

/// A chunk of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Incremental response text.
    pub delta: String,
    /// Error message, when the stream failed mid-flight.
    pub error: Option<String>,
}

/// Handle to a streaming model call: a chunk sequence plus the final
/// assembled response.
///
/// The loop drains [`next_chunk`](ModelStream::next_chunk) to completion
/// (forwarding deltas to the bus topic) and then awaits
/// [`response`](ModelStream::response). Final token counts come from the
/// assembled response, never from the chunks.
#[derive(Debug)]
pub struct ModelStream {
    chunks: mpsc::Receiver<StreamChunk>,
    response: oneshot::Receiver<Result<ModelResponse, ModelError>>,
}

impl ModelStream {
    /// Build a stream from its two channels. Clients send chunks on the
    /// first, then resolve the second with the assembled response.
    pub fn new(
        chunks: mpsc::Receiver<StreamChunk>,
        response: oneshot::Receiver<Result<ModelResponse, ModelError>>,
    ) -> Self {
        Self { chunks, response }
    }

    /// The next chunk, or `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    /// The final assembled response. Consumes the stream; call after the
    /// chunk sequence is exhausted.
    pub async fn response(self) -> Result<ModelResponse, ModelError> {
        match self.response.await {
            Ok(result) => result,
            Err(_) => Err(ModelError::RequestFailed(
                "stream dropped without a final response".into(),
            )),
        }
    }
}

/// Accumulates stream deltas into the final response text.
#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    text: String,
}

impl StreamAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta.
    pub fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// The text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume the accumulator, yielding the assembled text.
    pub fn into_text(self) -> String {
        self.text
    }
}

/// A language-model client.
///
/// Implementations MUST publish `BeforeModelCall` on `ctx` before the
/// request goes out and `AfterModelCall` (with usage, duration, and the
/// error if any) once it completes — for streaming calls, once the final
/// response is assembled. Implementations MUST honor the context's
/// cancellation token and return [`ModelError::Cancelled`] when it fires.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate a complete response.
    ///
    /// `stream_id` and `topic` identify the logical stream for observers
    /// even when the call itself is not streamed.
    async fn generate(
        &self,
        ctx: &ExecutionContext,
        stream_id: &str,
        topic: &str,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError>;

    /// Generate a streaming response.
    async fn generate_stream(
        &self,
        ctx: &ExecutionContext,
        stream_id: &str,
        topic: &str,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelStream, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_retryable() {
        assert!(ModelError::RateLimited.is_retryable());
        assert!(ModelError::RequestFailed("timeout".into()).is_retryable());
        assert!(!ModelError::AuthFailed("bad key".into()).is_retryable());
        assert!(!ModelError::Cancelled.is_retryable());
    }

    #[test]
    fn first_text_empty_choices() {
        let response = ModelResponse {
            model: "m".into(),
            choices: vec![],
            usage: TokenUsage::default(),
        };
        assert!(response.first_text().is_none());
    }

    #[test]
    fn accumulator_merges_in_order() {
        let mut acc = StreamAccumulator::new();
        acc.push("The answer");
        acc.push(" is 42");
        assert_eq!(acc.into_text(), "The answer is 42");
    }

    #[tokio::test]
    async fn stream_drains_then_resolves() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = oneshot::channel();
        let mut stream = ModelStream::new(chunk_rx, resp_rx);

        chunk_tx.send(StreamChunk { delta: "he".into(), error: None }).await.unwrap();
        chunk_tx.send(StreamChunk { delta: "llo".into(), error: None }).await.unwrap();
        drop(chunk_tx);
        resp_tx
            .send(Ok(ModelResponse {
                model: "m".into(),
                choices: vec![ModelChoice { content: "hello".into() }],
                usage: TokenUsage { input_tokens: 3, output_tokens: 2 },
            }))
            .ok();

        let mut acc = StreamAccumulator::new();
        while let Some(chunk) = stream.next_chunk().await {
            acc.push(&chunk.delta);
        }
        assert_eq!(acc.text(), "hello");

        let response = stream.response().await.unwrap();
        assert_eq!(response.first_text(), Some("hello"));
        assert_eq!(response.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn dropped_response_channel_is_an_error() {
        let (_chunk_tx, chunk_rx) = mpsc::channel::<StreamChunk>(1);
        let (resp_tx, resp_rx) = oneshot::channel::<Result<ModelResponse, ModelError>>();
        drop(resp_tx);
        let stream = ModelStream::new(chunk_rx, resp_rx);
        assert!(matches!(
            stream.response().await,
            Err(ModelError::RequestFailed(_))
        ));
    }
}
