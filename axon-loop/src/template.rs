//! The system prompt template.
//!
//! A thin layer over minijinja with a fixed parameter set: the
//! user-provided context (itself rendered as a template so it can use the
//! time provider), the output-structure description, the tool listing,
//! and the current time.

use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use std::sync::Arc;
use thiserror::Error;

/// Clock injected into prompts. Swap for a fixed clock in tests.
pub type TimeProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> TimeProvider {
    Arc::new(Utc::now)
}

/// A template failed to render.
#[derive(Debug, Error)]
#[error("template render failed: {0}")]
pub struct TemplateError(#[from] minijinja::Error);

/// Default system prompt: describes the think–act–observe loop and leaves
/// slots for context, tools, and structure.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are an agent that works in a think-act-observe loop. Each turn you
reason about the task, optionally invoke tools, observe their results,
and repeat until you can produce the final answer.

Current time: {{ now }}

{{ context }}

## Available tools

{{ tools }}

## Response structure

Respond using exactly the sections described below. Do not emit anything
outside them.

{{ structure }}";

/// A system prompt template with the fixed axon parameter set.
pub struct SystemPromptTemplate {
    source: String,
}

impl SystemPromptTemplate {
    /// Use a custom template source. Available variables: `context`,
    /// `structure`, `tools`, `now`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The built-in default template.
    pub fn default_template() -> Self {
        Self::new(DEFAULT_SYSTEM_TEMPLATE)
    }

    /// Render the system prompt. `user_context` is rendered first, with
    /// `now` in scope, then substituted into the outer template.
    pub fn render(
        &self,
        user_context: &str,
        structure: &str,
        tools: &str,
        now: &str,
    ) -> Result<String, TemplateError> {
        let env = Environment::new();
        let rendered_context = env.render_str(user_context, context! { now => now })?;
        let output = env.render_str(
            &self.source,
            context! {
                context => rendered_context,
                structure => structure,
                tools => tools,
                now => now,
            },
        )?;
        Ok(output)
    }
}

impl Default for SystemPromptTemplate {
    fn default() -> Self {
        Self::default_template()
    }
}
