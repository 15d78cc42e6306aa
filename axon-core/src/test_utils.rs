//! Test doubles for exercising the engine without a wire client.
//!
//! Gated behind the `test-utils` feature. The mocks follow the same
//! contract as real clients: they publish `BeforeModelCall` /
//! `AfterModelCall` on the supplied context and honor cancellation.

use crate::context::ExecutionContext;
use crate::message::Message;
use crate::model::{
    GenerateOptions, ModelChoice, ModelClient, ModelError, ModelResponse, ModelStream, StreamChunk,
    TokenUsage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Build a single-choice response with the given text and token counts.
pub fn text_response(text: &str, input_tokens: u64, output_tokens: u64) -> ModelResponse {
    ModelResponse {
        model: "scripted".into(),
        choices: vec![ModelChoice {
            content: text.to_string(),
        }],
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
    }
}

/// A model client that replays a queue of scripted results.
///
/// Panics when the queue runs dry — a scripted test that makes more model
/// calls than it queued responses for is a broken test.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
}

impl ScriptedModel {
    /// Create a client replaying `script` in order.
    pub fn new(script: Vec<Result<ModelResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    /// Create a client replaying successful text responses in order, each
    /// with fixed 10-in/5-out token usage.
    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(text_response(t, 10, 5))).collect())
    }

    /// Number of scripted results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock poisoned").len()
    }

    fn pop(&self) -> Result<ModelResponse, ModelError> {
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .expect("ScriptedModel: no more responses queued")
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(
        &self,
        ctx: &ExecutionContext,
        _stream_id: &str,
        _topic: &str,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ModelError> {
        let model = options.model.as_deref().unwrap_or("scripted");
        ctx.publish_before_model_call(model, messages);

        if ctx.is_cancelled() {
            ctx.publish_after_model_call(model, None, Duration::ZERO, Some("cancelled"));
            return Err(ModelError::Cancelled);
        }

        match self.pop() {
            Ok(response) => {
                ctx.publish_after_model_call(
                    model,
                    Some(&response),
                    Duration::from_millis(1),
                    None,
                );
                Ok(response)
            }
            Err(err) => {
                ctx.publish_after_model_call(
                    model,
                    None,
                    Duration::from_millis(1),
                    Some(&err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn generate_stream(
        &self,
        ctx: &ExecutionContext,
        stream_id: &str,
        topic: &str,
        messages: &[Message],
        options: &GenerateOptions,
    ) -> Result<ModelStream, ModelError> {
        let model = options.model.as_deref().unwrap_or("scripted");
        ctx.publish_before_model_call(model, messages);

        if ctx.is_cancelled() {
            ctx.publish_after_model_call(model, None, Duration::ZERO, Some("cancelled"));
            return Err(ModelError::Cancelled);
        }
        let _ = (stream_id, topic);

        match self.pop() {
            Ok(response) => {
                let text = response.first_text().unwrap_or_default().to_string();
                let deltas: Vec<String> = if text.is_empty() {
                    Vec::new()
                } else {
                    text.as_bytes()
                        .chunks(8)
                        .map(|c| String::from_utf8_lossy(c).into_owned())
                        .collect()
                };

                let (chunk_tx, chunk_rx) = mpsc::channel(deltas.len().max(1));
                let (resp_tx, resp_rx) = oneshot::channel();
                for delta in deltas {
                    chunk_tx
                        .send(StreamChunk { delta, error: None })
                        .await
                        .expect("scripted stream channel");
                }
                drop(chunk_tx);

                ctx.publish_after_model_call(
                    model,
                    Some(&response),
                    Duration::from_millis(1),
                    None,
                );
                resp_tx.send(Ok(response)).ok();
                Ok(ModelStream::new(chunk_rx, resp_rx))
            }
            Err(err) => {
                ctx.publish_after_model_call(
                    model,
                    None,
                    Duration::from_millis(1),
                    Some(&err.to_string()),
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_model_publishes_call_events() {
        let ctx = ExecutionContext::root("run").build();
        let model = ScriptedModel::replying(&["hello"]);

        let response = model
            .generate(&ctx, "s1", "llm-response", &[], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(response.first_text(), Some("hello"));

        let names: Vec<String> = ctx.events().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["before_model_call", "after_model_call"]);
        assert_eq!(ctx.stats().get_counter("input_tokens"), 10);
        assert_eq!(ctx.stats().get_counter("output_tokens"), 5);
    }

    #[tokio::test]
    async fn scripted_stream_chunks_reassemble() {
        let ctx = ExecutionContext::root("run").build();
        let model = ScriptedModel::replying(&["a longer streamed reply"]);

        let mut stream = model
            .generate_stream(&ctx, "s1", "llm-response", &[], &GenerateOptions::default())
            .await
            .unwrap();
        let mut assembled = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            assembled.push_str(&chunk.delta);
        }
        assert_eq!(assembled, "a longer streamed reply");
        let response = stream.response().await.unwrap();
        assert_eq!(response.first_text(), Some("a longer streamed reply"));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = ExecutionContext::root("run").build();
        ctx.cancellation_token().cancel();
        let model = ScriptedModel::replying(&["never"]);

        let result = model
            .generate(&ctx, "s1", "llm-response", &[], &GenerateOptions::default())
            .await;
        assert!(matches!(result, Err(ModelError::Cancelled)));
        assert_eq!(model.remaining(), 1);
    }
}
