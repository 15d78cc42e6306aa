#![deny(missing_docs)]
//! # axon-core — protocol types for the axon agent run-loop engine
//!
//! This crate defines the control plane that surrounds a model-driven agent
//! loop: per-run statistics, a synchronous event bus, limit enforcement,
//! the execution context that ties them together, the scratchpad the loop
//! feeds back to the model, and the model-client contract.
//!
//! | Concern | Module |
//! |---------|--------|
//! | Messages and content parts | [`message`] |
//! | Named output sections | [`section`] |
//! | Counters and gauges | [`stats`] |
//! | Event variants and bus | [`event`] |
//! | Threshold rules | [`limit`] |
//! | Iterations, scratchpad, loop data | [`scratchpad`] |
//! | Model client + streaming | [`model`] |
//! | Per-run execution context | [`context`] |
//!
//! ## Dependency Notes
//!
//! Extension data (iteration metadata, tool arguments, structured answers)
//! is carried as `serde_json::Value`. JSON is the interchange format of
//! agentic systems and `serde_json::Value` is the ecosystem standard; a
//! generic `T: Serialize` would cost trait-object safety for no practical
//! benefit.

pub mod context;
pub mod event;
pub mod limit;
pub mod message;
pub mod model;
pub mod scratchpad;
pub mod section;
pub mod stats;

#[cfg(feature = "test-utils")]
pub mod test_utils;

// Re-exports for convenience
pub use context::{ContextBuilder, ExecutionContext, TerminationReason, TerminationRecord};
pub use event::{BaseEvent, Event, EventBus, IterationOutcome, LoopAction, ParseErrorKind, StreamDelta};
pub use limit::{Limit, LimitEvaluator, LimitHit, LimitKind};
pub use message::{ContentPart, Message, Role};
pub use model::{
    GenerateOptions, ModelChoice, ModelClient, ModelError, ModelResponse, ModelStream,
    StreamAccumulator, StreamChunk, TokenUsage,
};
pub use scratchpad::{Iteration, IterationOrigin, LoopData, Scratchpad, PIN_IMPORTANCE};
pub use section::{Section, SectionSpec};
pub use stats::StatsStore;
