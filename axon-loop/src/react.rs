//! The ReAct loop: one think–act–observe step per call.

use crate::template::{system_clock, SystemPromptTemplate, TemplateError, TimeProvider};
use crate::termination::{Termination, TerminationDecision};
use axon_core::context::ExecutionContext;
use axon_core::event::{ParseErrorKind, StreamDelta};
use axon_core::message::{Message, Role};
use axon_core::model::{GenerateOptions, ModelClient, ModelError, ModelResponse};
use axon_core::scratchpad::Iteration;
use axon_core::section::{Section, SectionSpec};
use axon_core::stats::keys;
use axon_format::{FormatError, SectionFormat};
use axon_tool::{ToolChain, ToolError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Topic on which response chunks are forwarded to topic subscribers.
pub const LLM_RESPONSE_TOPIC: &str = "llm-response";

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Stream model responses, forwarding deltas to the
    /// [`LLM_RESPONSE_TOPIC`] topic.
    pub streaming: bool,
    /// Ask the model for a `thinking` section ahead of action/answer.
    pub thinking_section: bool,
    /// User-provided context for the system prompt. Itself a template
    /// with `now` in scope.
    pub user_context: String,
    /// Model call options.
    pub options: GenerateOptions,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            streaming: false,
            thinking_section: true,
            user_context: String::new(),
            options: GenerateOptions::default(),
        }
    }
}

/// Why a loop step produced a terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    /// The termination handler accepted an answer.
    Answer,
    /// The model call failed.
    ModelError,
    /// The response was unusable and there was nothing to feed back.
    ParseError,
    /// The cancellation signal fired.
    Cancelled,
}

/// The result of one loop step.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// An iteration was recorded; the run continues. The observation is
    /// empty when the model neither called tools nor drew feedback.
    Continue {
        /// Observation text fed back next iteration.
        observation: String,
    },
    /// The run is over.
    Terminate {
        /// Terminal text.
        text: String,
        /// Why the step terminated.
        cause: TerminalCause,
    },
}

/// Errors that prevent a loop step from running at all.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LoopError {
    /// The system prompt failed to render.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// The ReAct loop: composes the model client, tool chain, termination
/// handler, wire format, and system template.
pub struct ReactLoop {
    model: Arc<dyn ModelClient>,
    tools: ToolChain,
    termination: Box<dyn Termination>,
    format: SectionFormat,
    template: SystemPromptTemplate,
    time: TimeProvider,
    config: LoopConfig,
}

impl ReactLoop {
    /// Create a loop with the default XML format, template, wall clock,
    /// and config.
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: ToolChain,
        termination: Box<dyn Termination>,
    ) -> Self {
        Self {
            model,
            tools,
            termination,
            format: SectionFormat::default(),
            template: SystemPromptTemplate::default_template(),
            time: system_clock(),
            config: LoopConfig::default(),
        }
    }

    /// Use a different wire format.
    pub fn with_format(mut self, format: SectionFormat) -> Self {
        self.format = format;
        self
    }

    /// Use a custom system prompt template.
    pub fn with_template(mut self, template: SystemPromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// Use a custom time provider.
    pub fn with_time_provider(mut self, time: TimeProvider) -> Self {
        self.time = time;
        self
    }

    /// Replace the loop configuration.
    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// The wire format in use.
    pub fn format(&self) -> &SectionFormat {
        &self.format
    }

    fn section_specs(&self) -> Vec<SectionSpec> {
        let mut specs = Vec::with_capacity(3);
        if self.config.thinking_section {
            specs.push(SectionSpec::new(
                "thinking",
                "Reason about the task and what to do next. Not shown to the user.",
            ));
        }
        if !self.tools.registry().is_empty() {
            specs.push(SectionSpec::new(self.tools.name(), self.tools.guidance()));
        }
        specs.push(SectionSpec::new(
            self.termination.section(),
            self.termination.guidance(),
        ));
        specs
    }

    fn wrap_observation(&self, content: impl Into<String>) -> String {
        self.format
            .format_sections(&[Section::new("observation", content.into())])
    }

    fn record_iteration(&self, ctx: &ExecutionContext, raw: &str, observation: &str) {
        let mut messages = vec![Message::text(Role::Assistant, raw)];
        if !observation.is_empty() {
            messages.push(Message::text(Role::User, observation));
        }
        let iteration = Arc::new(Iteration::new(messages));
        ctx.with_loop_data(|data| {
            data.append_history(iteration.clone());
            data.scratchpad_mut().append(iteration.clone());
        });
    }

    async fn call_model(
        &self,
        ctx: &ExecutionContext,
        messages: &[Message],
    ) -> Result<ModelResponse, ModelError> {
        let stream_id = format!("llm-response-{}", ctx.iteration());
        if !self.config.streaming {
            return self
                .model
                .generate(ctx, &stream_id, LLM_RESPONSE_TOPIC, messages, &self.config.options)
                .await;
        }

        let mut stream = self
            .model
            .generate_stream(ctx, &stream_id, LLM_RESPONSE_TOPIC, messages, &self.config.options)
            .await?;
        while let Some(chunk) = stream.next_chunk().await {
            if !chunk.delta.is_empty() {
                ctx.bus().publish_delta(&StreamDelta {
                    stream_id: stream_id.clone(),
                    topic: LLM_RESPONSE_TOPIC.to_string(),
                    delta: chunk.delta,
                });
            }
            if let Some(error) = chunk.error {
                warn!(%error, "model stream reported an error chunk");
            }
        }
        stream.response().await
    }

    /// Run one loop step against the context's scratchpad.
    pub async fn next(&self, ctx: &ExecutionContext) -> Result<LoopStep, LoopError> {
        // 1. Build the prompt.
        let specs = self.section_specs();
        let structure = self.format.describe_structure(&specs);
        let tools_prompt = self.tools.prompt();
        let now = (self.time)().to_rfc3339();
        let system =
            self.template
                .render(&self.config.user_context, &structure, &tools_prompt, &now)?;

        let (original_input, scratchpad) =
            ctx.with_loop_data(|data| (data.original_input().to_vec(), data.scratchpad().items()));
        let mut messages = vec![
            Message::text(Role::System, system),
            Message::new(Role::User, original_input),
        ];
        for iteration in &scratchpad {
            messages.extend(iteration.messages().iter().cloned());
        }

        // 2. Call the model. Clients publish the model-call events.
        let response = match self.call_model(ctx, &messages).await {
            Ok(response) => response,
            Err(ModelError::Cancelled) => {
                return Ok(LoopStep::Terminate {
                    text: "run cancelled during model call".into(),
                    cause: TerminalCause::Cancelled,
                });
            }
            Err(err) => {
                return Ok(LoopStep::Terminate {
                    text: format!("model call failed: {err}"),
                    cause: TerminalCause::ModelError,
                });
            }
        };
        let Some(raw) = response.first_text().map(str::to_string) else {
            return Ok(LoopStep::Terminate {
                text: "model returned no choices".into(),
                cause: TerminalCause::ModelError,
            });
        };

        // 3. Parse into sections.
        let known: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let parsed = match self.format.parse(&known, &raw) {
            Ok(map) => {
                ctx.reset_gauge(&keys::parse_error_consecutive(ParseErrorKind::Format.as_str()));
                ctx.reset_gauge(&keys::parse_error_consecutive(
                    ParseErrorKind::Section.as_str(),
                ));
                map
            }
            Err(FormatError::Section { name, detail }) => {
                ctx.publish_parse_error(
                    ParseErrorKind::Section,
                    &raw,
                    &format!("malformed section <{name}>: {detail}"),
                );
                let observation = self.wrap_observation(format!(
                    "Your <{name}> section was malformed: {detail}. Fix the section and respond again."
                ));
                self.record_iteration(ctx, &raw, &observation);
                return Ok(LoopStep::Continue { observation });
            }
            Err(err) => {
                ctx.publish_parse_error(ParseErrorKind::Format, &raw, &err.to_string());
                if raw.trim().is_empty() {
                    // Nothing to show the model; feeding back an empty
                    // response only burns iterations.
                    return Ok(LoopStep::Terminate {
                        text: format!("unparseable empty model response: {err}"),
                        cause: TerminalCause::ParseError,
                    });
                }
                debug!(%err, "format parse error, feeding back as observation");
                let observation = self.wrap_observation(format!(
                    "Could not parse your response ({err}). Respond again using the required sections."
                ));
                self.record_iteration(ctx, &raw, &observation);
                return Ok(LoopStep::Continue { observation });
            }
        };

        // 4. Termination check first.
        let mut observation = String::new();
        if let Some(contents) = parsed.get(self.termination.section()) {
            match self.termination.should_terminate(ctx, &contents[0]).await {
                TerminationDecision::Terminate(answer) => {
                    self.record_iteration(ctx, &raw, "");
                    return Ok(LoopStep::Terminate {
                        text: answer.text,
                        cause: TerminalCause::Answer,
                    });
                }
                TerminationDecision::ContinueWithFeedback(feedback) => {
                    observation = self.wrap_observation(self.format.format_sections(&feedback));
                }
                TerminationDecision::Continue => {}
            }
        }

        // 5. Tool execution, unless validator feedback took the turn.
        if observation.is_empty() {
            if let Some(contents) = parsed.get(self.tools.name()) {
                match self.tools.execute(ctx, contents, &self.format).await {
                    Ok(result) => observation = result.text,
                    Err(ToolError::Cancelled) => {
                        // Partial tool state stays in stats; no iteration
                        // is appended for a cancelled batch.
                        return Ok(LoopStep::Terminate {
                            text: "run cancelled during tool execution".into(),
                            cause: TerminalCause::Cancelled,
                        });
                    }
                    Err(err) => {
                        observation = self.wrap_observation(format!(
                            "Your tool calls could not be parsed ({err}). \
                             Use `tool: <name>` and `args: <JSON object>`."
                        ));
                    }
                }
            }
        }

        // 6. Record the iteration.
        self.record_iteration(ctx, &raw, &observation);
        Ok(LoopStep::Continue { observation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::TextTermination;
    use async_trait::async_trait;
    use axon_core::test_utils::ScriptedModel;
    use axon_tool::{Tool, ToolRegistry};
    use serde_json::json;

    struct SearchTool;

    #[async_trait]
    impl Tool for SearchTool {
        fn name(&self) -> &str {
            "search"
        }
        fn description(&self) -> &str {
            "Searches the corpus"
        }
        fn args_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"q": {"type": "string"}}})
        }
        async fn invoke(
            &self,
            _ctx: &ExecutionContext,
            _args: serde_json::Value,
        ) -> Result<String, ToolError> {
            Ok("found it".into())
        }
    }

    fn react(model: ScriptedModel) -> ReactLoop {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SearchTool));
        ReactLoop::new(
            Arc::new(model),
            ToolChain::new(registry),
            Box::new(TextTermination::new()),
        )
    }

    fn ctx_with_input(text: &str) -> Arc<ExecutionContext> {
        let ctx = ExecutionContext::root("run").build();
        ctx.with_loop_data(|d| {
            d.set_original_input(vec![axon_core::message::ContentPart::text(text)])
        });
        ctx
    }

    #[tokio::test]
    async fn answer_terminates_with_trimmed_text() {
        let ctx = ctx_with_input("what is the answer?");
        let react = react(ScriptedModel::replying(&["<answer>The answer is 42</answer>"]));

        let step = react.next(&ctx).await.unwrap();
        assert_eq!(
            step,
            LoopStep::Terminate {
                text: "The answer is 42".into(),
                cause: TerminalCause::Answer,
            }
        );
        // The terminal iteration lands in history and scratchpad without
        // an observation message.
        ctx.with_loop_data(|d| {
            assert_eq!(d.history().len(), 1);
            assert_eq!(d.scratchpad().len(), 1);
            assert_eq!(d.history()[0].messages().len(), 1);
        });
    }

    #[tokio::test]
    async fn tool_call_produces_observation_iteration() {
        let ctx = ctx_with_input("search for it");
        let react = react(ScriptedModel::replying(&[
            "<action>tool: search\nargs: {\"q\": \"test\"}</action>",
        ]));

        let step = react.next(&ctx).await.unwrap();
        let LoopStep::Continue { observation } = step else {
            panic!("expected Continue");
        };
        assert!(observation.contains("found it"));
        assert_eq!(ctx.stats().get_counter("tool_calls"), 1);
        assert_eq!(ctx.stats().get_counter("tool_calls:search"), 1);
        ctx.with_loop_data(|d| {
            assert_eq!(d.scratchpad().len(), 1);
            // assistant response + user observation
            assert_eq!(d.scratchpad().at(0).unwrap().messages().len(), 2);
        });
    }

    #[tokio::test]
    async fn format_parse_error_feeds_back_and_continues() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::replying(&["no sections here at all"]));

        let step = react.next(&ctx).await.unwrap();
        let LoopStep::Continue { observation } = step else {
            panic!("expected Continue");
        };
        assert!(observation.contains("Could not parse"));
        assert_eq!(ctx.stats().get_counter("format_parse_error_total"), 1);
        assert_eq!(ctx.stats().get_gauge("format_parse_error_consecutive"), 1.0);
    }

    #[tokio::test]
    async fn successful_parse_resets_format_consecutive() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::replying(&[
            "prose without sections",
            "<answer>done</answer>",
        ]));

        react.next(&ctx).await.unwrap();
        assert_eq!(ctx.stats().get_gauge("format_parse_error_consecutive"), 1.0);
        react.next(&ctx).await.unwrap();
        assert_eq!(ctx.stats().get_gauge("format_parse_error_consecutive"), 0.0);
        assert_eq!(ctx.stats().get_counter("format_parse_error_total"), 1);
    }

    #[tokio::test]
    async fn empty_response_is_fatal() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::replying(&[""]));

        let step = react.next(&ctx).await.unwrap();
        assert!(matches!(
            step,
            LoopStep::Terminate {
                cause: TerminalCause::ParseError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn model_error_terminates() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::new(vec![Err(ModelError::RateLimited)]));

        let step = react.next(&ctx).await.unwrap();
        match step {
            LoopStep::Terminate { text, cause } => {
                assert_eq!(cause, TerminalCause::ModelError);
                assert!(text.contains("rate limited"));
            }
            other => panic!("expected Terminate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn toolchain_parse_error_becomes_observation() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::replying(&["<action>gibberish</action>"]));

        let step = react.next(&ctx).await.unwrap();
        let LoopStep::Continue { observation } = step else {
            panic!("expected Continue");
        };
        assert!(observation.contains("could not be parsed"));
        assert_eq!(ctx.stats().get_counter("toolchain_parse_error_total"), 1);
    }

    #[tokio::test]
    async fn streaming_forwards_deltas_to_topic() {
        let ctx = ctx_with_input("q");
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();
        ctx.bus().subscribe_topic(LLM_RESPONSE_TOPIC, move |delta| {
            seen2.lock().unwrap().push_str(&delta.delta);
        });

        let react = react(ScriptedModel::replying(&["<answer>streamed fine</answer>"]))
            .with_config(LoopConfig {
                streaming: true,
                ..Default::default()
            });

        let step = react.next(&ctx).await.unwrap();
        assert!(matches!(step, LoopStep::Terminate { .. }));
        assert_eq!(&*seen.lock().unwrap(), "<answer>streamed fine</answer>");
    }

    #[tokio::test]
    async fn scratchpad_feeds_next_prompt() {
        let ctx = ctx_with_input("q");
        let react = react(ScriptedModel::replying(&[
            "<action>tool: search\nargs: {\"q\": \"x\"}</action>",
            "<answer>done</answer>",
        ]));

        react.next(&ctx).await.unwrap();
        react.next(&ctx).await.unwrap();

        // The second BeforeModelCall carries the first iteration's
        // assistant/observation pair.
        let events = ctx.events();
        let second_call = events
            .iter()
            .filter_map(|e| match e {
                axon_core::event::Event::BeforeModelCall { messages, .. } => Some(messages),
                _ => None,
            })
            .nth(1)
            .unwrap();
        assert_eq!(second_call.len(), 4);
        assert!(second_call[2].joined_text().contains("tool: search"));
        assert!(second_call[3].joined_text().contains("found it"));
    }
}
