//! Termination handling: deciding when a parsed section is the final
//! answer, with an optional validator gate that can reject and feed back.

use async_trait::async_trait;
use axon_core::context::ExecutionContext;
use axon_core::event::ParseErrorKind;
use axon_core::section::Section;
use axon_core::stats::keys;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// An accepted terminal answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalAnswer {
    /// The terminal text returned to the caller.
    pub text: String,
    /// The decoded value, for structured terminations.
    pub value: Option<serde_json::Value>,
}

/// What a termination handler decided about a candidate section.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationDecision {
    /// The run is over; this is the answer.
    Terminate(TerminalAnswer),
    /// Not a terminal answer; the loop continues.
    Continue,
    /// A validator rejected the answer; the loop continues and the
    /// feedback sections become the next observation.
    ContinueWithFeedback(Vec<Section>),
}

/// Decides whether the terminal section ends the run.
#[async_trait]
pub trait Termination: Send + Sync {
    /// The section name this handler claims (conventionally `answer`).
    fn section(&self) -> &str;

    /// Guidance shown in the structure description.
    fn guidance(&self) -> &str;

    /// Judge one candidate section content.
    async fn should_terminate(&self, ctx: &ExecutionContext, raw: &str) -> TerminationDecision;
}

/// A validator's verdict on a decoded answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Whether the answer is accepted.
    pub accepted: bool,
    /// Feedback sections, filled on rejection.
    pub feedback: Vec<Section>,
}

impl Validation {
    /// Accept the answer.
    pub fn accept() -> Self {
        Self {
            accepted: true,
            feedback: Vec::new(),
        }
    }

    /// Reject the answer with feedback sections.
    pub fn reject(feedback: Vec<Section>) -> Self {
        Self {
            accepted: false,
            feedback,
        }
    }
}

/// Optional gate on a decoded terminal answer.
#[async_trait]
pub trait Validator: Send + Sync {
    /// The validator's name, used in events and rejection stats.
    fn name(&self) -> &str;

    /// Judge a decoded answer.
    async fn validate(&self, ctx: &ExecutionContext, answer: &serde_json::Value) -> Validation;
}

/// Plain-text termination: any non-empty trimmed content is the answer.
pub struct TextTermination {
    section: String,
    guidance: String,
}

impl TextTermination {
    /// Create a text termination claiming the `answer` section.
    pub fn new() -> Self {
        Self {
            section: "answer".into(),
            guidance: "The final answer, as plain text. Emit this section only when you are done."
                .into(),
        }
    }

    /// Claim a different section name.
    pub fn with_section(mut self, name: impl Into<String>) -> Self {
        self.section = name.into();
        self
    }

    /// Replace the guidance text.
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = guidance.into();
        self
    }
}

impl Default for TextTermination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Termination for TextTermination {
    fn section(&self) -> &str {
        &self.section
    }

    fn guidance(&self) -> &str {
        &self.guidance
    }

    async fn should_terminate(&self, ctx: &ExecutionContext, raw: &str) -> TerminationDecision {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return TerminationDecision::Continue;
        }
        ctx.reset_gauge(&keys::parse_error_consecutive(
            ParseErrorKind::Termination.as_str(),
        ));
        TerminationDecision::Terminate(TerminalAnswer {
            text: trimmed.to_string(),
            value: None,
        })
    }
}

/// Structured termination: the section must decode into `T`. An invalid
/// decode is a termination parse error and the run continues; a decode
/// success passes through the validator when one is installed.
pub struct StructuredTermination<T> {
    section: String,
    guidance: String,
    validator: Option<Arc<dyn Validator>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StructuredTermination<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    /// Create a structured termination claiming the `answer` section.
    pub fn new() -> Self {
        Self {
            section: "answer".into(),
            guidance: "The final answer, as a JSON object in the expected shape. \
                       Emit this section only when you are done."
                .into(),
            validator: None,
            _marker: PhantomData,
        }
    }

    /// Claim a different section name.
    pub fn with_section(mut self, name: impl Into<String>) -> Self {
        self.section = name.into();
        self
    }

    /// Replace the guidance text.
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = guidance.into();
        self
    }

    /// Install a validator gate.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Install a validator gate on an existing handler.
    pub fn set_validator(&mut self, validator: Arc<dyn Validator>) {
        self.validator = Some(validator);
    }
}

impl<T> Default for StructuredTermination<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Termination for StructuredTermination<T>
where
    T: DeserializeOwned + Serialize + Send + Sync,
{
    fn section(&self) -> &str {
        &self.section
    }

    fn guidance(&self) -> &str {
        &self.guidance
    }

    async fn should_terminate(&self, ctx: &ExecutionContext, raw: &str) -> TerminationDecision {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return TerminationDecision::Continue;
        }
        let typed: T = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                ctx.publish_parse_error(ParseErrorKind::Termination, raw, &err.to_string());
                return TerminationDecision::Continue;
            }
        };
        ctx.reset_gauge(&keys::parse_error_consecutive(
            ParseErrorKind::Termination.as_str(),
        ));
        let value = serde_json::to_value(&typed).unwrap_or(serde_json::Value::Null);

        let Some(validator) = &self.validator else {
            return TerminationDecision::Terminate(TerminalAnswer {
                text: trimmed.to_string(),
                value: Some(value),
            });
        };

        ctx.publish_validator_called(validator.name(), &value);
        let verdict = validator.validate(ctx, &value).await;
        ctx.publish_validator_result(validator.name(), &value, verdict.accepted, &verdict.feedback);
        if verdict.accepted {
            TerminationDecision::Terminate(TerminalAnswer {
                text: trimmed.to_string(),
                value: Some(value),
            })
        } else {
            TerminationDecision::ContinueWithFeedback(verdict.feedback)
        }
    }
}
