//! The tool chain: owns the `action` section end to end.

use crate::{Tool, ToolError, ToolRegistry};
use axon_core::context::ExecutionContext;
use axon_core::event::ParseErrorKind;
use axon_core::section::Section;
use axon_core::stats::keys;
use axon_format::SectionFormat;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One parsed tool call: name plus decoded JSON arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// The tool to invoke.
    pub tool: String,
    /// Decoded arguments.
    pub args: serde_json::Value,
}

/// Raw per-call results, aligned by index with `calls`.
#[derive(Debug, Clone, Default)]
pub struct RawToolResults {
    /// The parsed calls, in execution order.
    pub calls: Vec<ToolCall>,
    /// Per-call output, `None` for failed calls.
    pub results: Vec<Option<String>>,
    /// Per-call error message, `None` for successful calls.
    pub errors: Vec<Option<String>>,
}

/// What an `execute` pass produced: the assembled observation text plus
/// the raw per-call record.
#[derive(Debug, Clone)]
pub struct ToolChainResult {
    /// Observation text, one envelope per call, blank-line separated.
    pub text: String,
    /// The raw per-call record.
    pub raw: RawToolResults,
}

/// Owns a set of tools and the section that carries their calls.
///
/// Section syntax, one block per call, blank-line separated:
///
/// ```text
/// tool: search
/// args: {"q": "test"}
/// ```
///
/// `args:` may be omitted (defaults to `{}`) and its JSON may span
/// multiple lines, ending at the next `tool:` line.
pub struct ToolChain {
    registry: ToolRegistry,
    section: String,
}

impl ToolChain {
    /// Create a chain over a registry, claiming the `action` section.
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            section: "action".into(),
        }
    }

    /// Claim a different section name.
    pub fn with_section(mut self, name: impl Into<String>) -> Self {
        self.section = name.into();
        self
    }

    /// The section name this chain claims.
    pub fn name(&self) -> &str {
        &self.section
    }

    /// The tool registry.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Guidance for the action section, shown in the structure
    /// description.
    pub fn guidance(&self) -> String {
        "Invoke tools. One block per call:\ntool: <name>\nargs: <JSON object>\n\
         Separate multiple calls with a blank line."
            .to_string()
    }

    /// The tool listing for the system prompt: names, descriptions, and
    /// argument schemas, sorted by name.
    pub fn prompt(&self) -> String {
        if self.registry.is_empty() {
            return "(no tools available)".to_string();
        }
        self.registry
            .sorted()
            .iter()
            .map(|tool| {
                format!(
                    "- {}: {}\n  args schema: {}",
                    tool.name(),
                    tool.description(),
                    tool.args_schema()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse one section's content into tool calls.
    pub fn parse_calls(content: &str) -> Result<Vec<ToolCall>, ToolError> {
        struct Builder {
            tool: String,
            args_seen: bool,
            args: String,
        }

        fn finish(builder: Builder) -> Result<ToolCall, ToolError> {
            if builder.tool.is_empty() {
                return Err(ToolError::Parse("missing tool name".into()));
            }
            let args = if builder.args.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(builder.args.trim())
                    .map_err(|e| ToolError::Parse(format!("invalid args JSON: {e}")))?
            };
            Ok(ToolCall {
                tool: builder.tool,
                args,
            })
        }

        let mut calls = Vec::new();
        let mut current: Option<Builder> = None;
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("tool:") {
                if let Some(builder) = current.take() {
                    calls.push(finish(builder)?);
                }
                current = Some(Builder {
                    tool: rest.trim().to_string(),
                    args_seen: false,
                    args: String::new(),
                });
            } else if let Some(builder) = current.as_mut() {
                if builder.args_seen {
                    builder.args.push('\n');
                    builder.args.push_str(line);
                } else if let Some(rest) = trimmed.strip_prefix("args:") {
                    builder.args_seen = true;
                    builder.args.push_str(rest.trim_start());
                } else if !trimmed.is_empty() {
                    return Err(ToolError::Parse(format!(
                        "unexpected line in tool call block: {trimmed}"
                    )));
                }
            } else if !trimmed.is_empty() {
                return Err(ToolError::Parse(format!(
                    "content before first tool name: {trimmed}"
                )));
            }
        }
        if let Some(builder) = current.take() {
            calls.push(finish(builder)?);
        }
        if calls.is_empty() {
            return Err(ToolError::Parse("no tool calls found".into()));
        }
        Ok(calls)
    }

    /// Execute every call in the given raw section contents, in order.
    ///
    /// On a parse failure publishes `ParseError(kind=toolchain)` and
    /// returns the error; no call runs. On success the toolchain
    /// consecutive gauge is reset. Per-call failures (including unknown
    /// tools) do not abort the pass — they land in the observation so the
    /// model can correct itself.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        raw_contents: &[String],
        format: &SectionFormat,
    ) -> Result<ToolChainResult, ToolError> {
        let mut calls = Vec::new();
        for raw in raw_contents {
            match Self::parse_calls(raw) {
                Ok(parsed) => calls.extend(parsed),
                Err(err) => {
                    ctx.publish_parse_error(ParseErrorKind::Toolchain, raw, &err.to_string());
                    return Err(err);
                }
            }
        }
        ctx.reset_gauge(&keys::parse_error_consecutive(
            ParseErrorKind::Toolchain.as_str(),
        ));

        let mut raw_results = RawToolResults {
            calls: calls.clone(),
            results: Vec::with_capacity(calls.len()),
            errors: Vec::with_capacity(calls.len()),
        };
        let mut envelopes = Vec::with_capacity(calls.len());

        for call in &calls {
            if ctx.is_cancelled() {
                return Err(ToolError::Cancelled);
            }

            ctx.publish_before_tool_call(&call.tool, &call.args);
            let started = Instant::now();
            let outcome = match self.registry.get(&call.tool) {
                Some(tool) => self.invoke_one(tool, ctx, call).await,
                None => Err(ToolError::NotFound(call.tool.clone())),
            };
            let duration = started.elapsed();

            match outcome {
                Ok(output) => {
                    ctx.publish_after_tool_call(
                        &call.tool,
                        &call.args,
                        Some(&output),
                        duration,
                        None,
                    );
                    ctx.reset_gauge(keys::TOOL_CALL_ERROR_CONSECUTIVE);
                    ctx.reset_gauge(&keys::per_target(
                        keys::TOOL_CALL_ERROR_CONSECUTIVE,
                        &call.tool,
                    ));
                    envelopes.push(format.format_sections(&[Section::new(
                        "observation",
                        format!("tool: {}\n{}", call.tool, output),
                    )]));
                    raw_results.results.push(Some(output));
                    raw_results.errors.push(None);
                }
                Err(err) => {
                    let message = err.to_string();
                    debug!(tool = %call.tool, error = %message, "tool call failed");
                    ctx.publish_after_tool_call(
                        &call.tool,
                        &call.args,
                        None,
                        duration,
                        Some(&message),
                    );
                    envelopes.push(format.format_sections(&[Section::new(
                        "observation",
                        format!("tool: {}\nerror: {}", call.tool, message),
                    )]));
                    raw_results.results.push(None);
                    raw_results.errors.push(Some(message));
                }
            }
        }

        Ok(ToolChainResult {
            text: envelopes.join("\n\n"),
            raw: raw_results,
        })
    }

    async fn invoke_one(
        &self,
        tool: &Arc<dyn Tool>,
        ctx: &ExecutionContext,
        call: &ToolCall,
    ) -> Result<String, ToolError> {
        tokio::select! {
            result = tool.invoke(ctx, call.args.clone()) => result,
            _ = ctx.cancellation_token().cancelled() => Err(ToolError::Cancelled),
        }
    }
}
