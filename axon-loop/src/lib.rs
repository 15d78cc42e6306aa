#![deny(missing_docs)]
//! The axon ReAct loop and its executor.
//!
//! [`ReactLoop`] drives one think–act–observe step: it assembles the
//! prompt from the system template, output-structure description, and
//! scratchpad, calls the model, parses the response into sections, and
//! dispatches termination and tool calls. [`AgentExecutor`] drives the
//! loop to completion, checking limits at the start of every iteration
//! and running compaction between iterations.

pub mod executor;
pub mod react;
pub mod template;
pub mod termination;

pub use executor::{AgentExecutor, ExecutorConfig, RunReport};
pub use react::{LoopConfig, LoopError, LoopStep, ReactLoop, TerminalCause, LLM_RESPONSE_TOPIC};
pub use template::{system_clock, SystemPromptTemplate, TemplateError, TimeProvider};
pub use termination::{
    StructuredTermination, TerminalAnswer, Termination, TerminationDecision, TextTermination,
    Validation, Validator,
};
