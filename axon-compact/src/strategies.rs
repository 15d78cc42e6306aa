//! Compaction strategies implementing [`CompactionStrategy`].

use crate::{CompactError, CompactionStrategy};
use async_trait::async_trait;
use axon_core::context::ExecutionContext;
use axon_core::message::{Message, Role};
use axon_core::model::{GenerateOptions, ModelClient};
use axon_core::scratchpad::{Iteration, IterationOrigin};
use std::sync::Arc;
use tracing::debug;

// ---- SlidingWindowStrategy --------------------------------------------------

/// Keeps all pinned iterations plus the last `keep` unpinned iterations,
/// preserving original relative order.
pub struct SlidingWindowStrategy {
    keep: usize,
}

impl SlidingWindowStrategy {
    /// Creates a new `SlidingWindowStrategy` keeping the last `keep`
    /// (>= 1) unpinned iterations.
    pub fn new(keep: usize) -> Self {
        Self { keep: keep.max(1) }
    }
}

#[async_trait]
impl CompactionStrategy for SlidingWindowStrategy {
    async fn compact(&self, ctx: &ExecutionContext) -> Result<(), CompactError> {
        let keep = self.keep;
        ctx.with_loop_data(|data| {
            let items = data.scratchpad().items();
            let unpinned = items.iter().filter(|it| !it.is_pinned()).count();
            if unpinned <= keep {
                return;
            }
            let mut to_drop = unpinned - keep;
            let kept: Vec<_> = items
                .into_iter()
                .filter(|it| {
                    if it.is_pinned() {
                        true
                    } else if to_drop > 0 {
                        to_drop -= 1;
                        false
                    } else {
                        true
                    }
                })
                .collect();
            debug!(kept = kept.len(), "sliding window compacted scratchpad");
            data.scratchpad_mut().replace(kept);
        });
        Ok(())
    }
}

// ---- SummarizationStrategy --------------------------------------------------

/// Default prompt template for [`SummarizationStrategy`]. The
/// `{existing_summary}` and `{new_messages}` slots are filled at
/// compaction time.
pub const DEFAULT_SUMMARY_TEMPLATE: &str = "\
Condense the agent working memory below into a single running summary. \
Preserve decisions, tool results, and open threads. Respond with the \
summary text only.

{existing_summary}

{new_messages}";

/// Summarizes old iterations through a model call, preserving pinned
/// iterations and the last `keep_recent` unpinned iterations verbatim.
///
/// The result is `[synthetic summary, pinned…, recent…]` with original
/// order preserved within each group; at most one synthetic iteration
/// exists at a time (a previous summary is folded into the new one).
/// Multi-modal parts are dropped during text extraction — pin iterations
/// whose non-text parts matter.
pub struct SummarizationStrategy {
    model: Arc<dyn ModelClient>,
    keep_recent: usize,
    template: String,
}

impl SummarizationStrategy {
    /// Creates a new `SummarizationStrategy`.
    ///
    /// # Arguments
    /// * `model` — the client used for the summarization call
    /// * `keep_recent` — number of most-recent unpinned iterations kept
    ///   verbatim (0 summarizes everything unpinned)
    pub fn new(model: Arc<dyn ModelClient>, keep_recent: usize) -> Self {
        Self {
            model,
            keep_recent,
            template: DEFAULT_SUMMARY_TEMPLATE.to_string(),
        }
    }

    /// Replace the prompt template. Must contain the `{existing_summary}`
    /// and `{new_messages}` slots.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

#[async_trait]
impl CompactionStrategy for SummarizationStrategy {
    async fn compact(&self, ctx: &ExecutionContext) -> Result<(), CompactError> {
        // Single walk: pinned, the existing summary (at most one), and
        // plain unpinned iterations.
        let items = ctx.with_loop_data(|data| data.scratchpad().items());
        let mut pinned = Vec::new();
        let mut existing_summary: Option<Arc<Iteration>> = None;
        let mut rest = Vec::new();
        for item in items {
            if item.is_pinned() {
                pinned.push(item);
            } else if item.is_synthetic() && existing_summary.is_none() {
                existing_summary = Some(item);
            } else {
                rest.push(item);
            }
        }

        let (to_summarize, to_keep) = if self.keep_recent > 0 && rest.len() > self.keep_recent {
            let split = rest.len() - self.keep_recent;
            (rest[..split].to_vec(), rest[split..].to_vec())
        } else if self.keep_recent == 0 && !rest.is_empty() {
            (rest, Vec::new())
        } else {
            return Ok(());
        };

        let existing_block = match &existing_summary {
            Some(summary) => format!("## Existing Summary\n\n{}", summary.joined_text()),
            None => "## Existing Summary\n\nNone (first compaction).".to_string(),
        };
        let extracted: Vec<String> = to_summarize
            .iter()
            .enumerate()
            .map(|(i, it)| format!("### Message {}\n{}", i + 1, it.joined_text()))
            .collect();
        let new_block = format!(
            "## New Messages to Incorporate\n\n{}",
            extracted.join("\n\n")
        );
        let prompt = self
            .template
            .replace("{existing_summary}", &existing_block)
            .replace("{new_messages}", &new_block);

        let stream_id = format!("compaction-summarization-{}", ctx.iteration());
        let response = self
            .model
            .generate(
                ctx,
                &stream_id,
                "compaction",
                &[Message::text(Role::User, prompt)],
                &GenerateOptions::default(),
            )
            .await?;
        let Some(summary_text) = response.first_text() else {
            return Err(CompactError::NoChoices);
        };

        let synthetic = Arc::new(
            Iteration::new(vec![Message::text(Role::Generic, summary_text)])
                .with_origin(IterationOrigin::CompactedSynthetic),
        );

        let mut compacted = Vec::with_capacity(1 + pinned.len() + to_keep.len());
        compacted.push(synthetic);
        compacted.extend(pinned);
        compacted.extend(to_keep);
        debug!(
            summarized = to_summarize.len(),
            kept = compacted.len(),
            "summarization compacted scratchpad"
        );
        ctx.with_loop_data(|data| data.scratchpad_mut().replace(compacted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::model::{ModelError, ModelResponse, TokenUsage};
    use axon_core::scratchpad::PIN_IMPORTANCE;
    use axon_core::test_utils::{text_response, ScriptedModel};

    fn it(text: &str) -> Arc<Iteration> {
        Arc::new(Iteration::new(vec![Message::text(Role::Assistant, text)]))
    }

    fn pinned(text: &str) -> Arc<Iteration> {
        Arc::new(
            Iteration::new(vec![Message::text(Role::Assistant, text)])
                .with_importance(PIN_IMPORTANCE),
        )
    }

    fn load(ctx: &ExecutionContext, items: Vec<Arc<Iteration>>) {
        ctx.with_loop_data(|data| data.scratchpad_mut().replace(items));
    }

    fn texts(ctx: &ExecutionContext) -> Vec<String> {
        ctx.with_loop_data(|data| {
            data.scratchpad().iter().map(|it| it.joined_text()).collect()
        })
    }

    #[tokio::test]
    async fn sliding_window_keeps_pins_and_last_n() {
        let ctx = ExecutionContext::root("run").build();
        load(
            &ctx,
            vec![
                it("a"),
                pinned("pin2"),
                it("b"),
                it("c"),
                pinned("pin4"),
                it("d"),
                it("e"),
            ],
        );

        SlidingWindowStrategy::new(2).compact(&ctx).await.unwrap();
        assert_eq!(texts(&ctx), vec!["pin2", "pin4", "d", "e"]);
    }

    #[tokio::test]
    async fn sliding_window_noop_when_under_limit() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("a"), pinned("p"), it("b")]);
        SlidingWindowStrategy::new(2).compact(&ctx).await.unwrap();
        assert_eq!(texts(&ctx), vec!["a", "p", "b"]);
    }

    #[tokio::test]
    async fn sliding_window_preserves_pinned_identity() {
        let ctx = ExecutionContext::root("run").build();
        let pin = pinned("keep me");
        load(&ctx, vec![it("a"), pin.clone(), it("b"), it("c")]);
        SlidingWindowStrategy::new(1).compact(&ctx).await.unwrap();
        let survivor = ctx.with_loop_data(|data| data.scratchpad().at(0).unwrap().clone());
        assert!(Arc::ptr_eq(&survivor, &pin));
    }

    #[tokio::test]
    async fn summarization_hybrid_keeps_recent() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("old1"), it("old2"), it("rec1"), it("rec2")]);
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_response(
            "Summary of old 1-2",
            20,
            8,
        ))]));

        SummarizationStrategy::new(model, 2)
            .compact(&ctx)
            .await
            .unwrap();

        assert_eq!(texts(&ctx), vec!["Summary of old 1-2", "rec1", "rec2"]);
        let first = ctx.with_loop_data(|data| data.scratchpad().at(0).unwrap().clone());
        assert!(first.is_synthetic());
        // The summarization call flows through the usual model-call stats.
        assert_eq!(ctx.stats().get_counter("input_tokens"), 20);
        assert_eq!(ctx.stats().get_counter("output_tokens"), 8);
    }

    #[tokio::test]
    async fn summarization_folds_previous_summary() {
        let ctx = ExecutionContext::root("run").build();
        let old_summary = Arc::new(
            Iteration::new(vec![Message::text(Role::Generic, "earlier summary")])
                .with_origin(IterationOrigin::CompactedSynthetic),
        );
        load(&ctx, vec![old_summary, it("x1"), it("x2"), it("recent")]);
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_response("merged", 5, 2))]));

        SummarizationStrategy::new(model, 1)
            .compact(&ctx)
            .await
            .unwrap();

        let result = texts(&ctx);
        assert_eq!(result, vec!["merged", "recent"]);
        let synthetic_count = ctx.with_loop_data(|data| {
            data.scratchpad().iter().filter(|it| it.is_synthetic()).count()
        });
        assert_eq!(synthetic_count, 1);
    }

    #[tokio::test]
    async fn summarization_keep_zero_summarizes_everything() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("a"), it("b")]);
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_response("all of it", 5, 2))]));

        SummarizationStrategy::new(model, 0)
            .compact(&ctx)
            .await
            .unwrap();
        assert_eq!(texts(&ctx), vec!["all of it"]);
    }

    #[tokio::test]
    async fn summarization_noop_when_nothing_to_fold() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("only"), it("two")]);
        // keep_recent covers everything; the model must not be called.
        let model = Arc::new(ScriptedModel::new(vec![]));
        SummarizationStrategy::new(model, 5)
            .compact(&ctx)
            .await
            .unwrap();
        assert_eq!(texts(&ctx), vec!["only", "two"]);
    }

    #[tokio::test]
    async fn summarization_model_error_leaves_scratchpad_unchanged() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("a"), it("b"), it("c")]);
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::RateLimited)]));

        let err = SummarizationStrategy::new(model, 1)
            .compact(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::Model(_)));
        assert_eq!(texts(&ctx), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn summarization_empty_choices_is_an_error() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("a"), it("b")]);
        let empty = ModelResponse {
            model: "scripted".into(),
            choices: vec![],
            usage: TokenUsage::default(),
        };
        let model = Arc::new(ScriptedModel::new(vec![Ok(empty)]));

        let err = SummarizationStrategy::new(model, 1)
            .compact(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CompactError::NoChoices));
        assert_eq!(texts(&ctx), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn summarization_prompt_carries_markers() {
        let ctx = ExecutionContext::root("run").build();
        load(&ctx, vec![it("first fact"), it("second fact"), it("recent")]);
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_response("s", 1, 1))]));
        SummarizationStrategy::new(model, 1)
            .compact(&ctx)
            .await
            .unwrap();

        // The request messages are visible on the bus.
        let events = ctx.events();
        let prompt = events
            .iter()
            .find_map(|e| match e {
                axon_core::event::Event::BeforeModelCall { messages, .. } => {
                    Some(messages[0].joined_text())
                }
                _ => None,
            })
            .unwrap();
        assert!(prompt.contains("None (first compaction)."));
        assert!(prompt.contains("### Message 1\nfirst fact"));
        assert!(prompt.contains("### Message 2\nsecond fact"));
        assert!(!prompt.contains("recent"));
    }
}
