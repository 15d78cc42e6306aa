#![deny(missing_docs)]
//! # axon — umbrella crate
//!
//! Provides a single import surface for the axon agent run-loop engine.
//! Re-exports the member crates behind feature flags, plus a `prelude`
//! for the happy path.

pub use axon_core;
#[cfg(feature = "compact")]
pub use axon_compact;
#[cfg(feature = "format")]
pub use axon_format;
#[cfg(feature = "loop")]
pub use axon_loop;
#[cfg(feature = "tool")]
pub use axon_tool;

/// Happy-path imports for composing axon runs.
pub mod prelude {
    pub use axon_core::{
        ContentPart, Event, EventBus, ExecutionContext, GenerateOptions, Iteration,
        IterationOrigin, Limit, LimitHit, LimitKind, LoopData, Message, ModelClient, ModelError,
        ModelResponse, ModelStream, Role, Scratchpad, StatsStore, TerminationReason,
    };

    #[cfg(feature = "format")]
    pub use axon_format::{FormatError, SectionFormat, SectionMap};

    #[cfg(feature = "tool")]
    pub use axon_tool::{Tool, ToolChain, ToolError, ToolRegistry};

    #[cfg(feature = "compact")]
    pub use axon_compact::{
        CompactionStrategy, CompactionTrigger, KeyMatch, SlidingWindowStrategy, StatsTrigger,
        SummarizationStrategy,
    };

    #[cfg(feature = "loop")]
    pub use axon_loop::{
        AgentExecutor, ExecutorConfig, LoopConfig, ReactLoop, RunReport, StructuredTermination,
        Termination, TextTermination, Validation, Validator,
    };
}
