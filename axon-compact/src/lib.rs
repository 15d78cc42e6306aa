#![deny(missing_docs)]
//! Scratchpad compaction for axon.
//!
//! Compaction is split into two seams the executor composes between
//! iterations: a [`CompactionTrigger`] decides *when* from stats deltas
//! and gauges, and a [`CompactionStrategy`] decides *how*, rewriting the
//! context's scratchpad in place. Pinned iterations (importance score at
//! or above the pin threshold) survive every strategy untouched.

use async_trait::async_trait;
use axon_core::context::ExecutionContext;
use axon_core::model::ModelError;
use thiserror::Error;

pub mod strategies;
pub mod trigger;

pub use strategies::{SlidingWindowStrategy, SummarizationStrategy, DEFAULT_SUMMARY_TEMPLATE};
pub use trigger::{KeyMatch, StatsTrigger};

/// Errors from compaction strategies. A failed compaction leaves the
/// scratchpad unchanged; the executor logs it and the run continues.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CompactError {
    /// The summarization model call failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// The summarization model returned an empty choice list.
    #[error("summarization model returned no choices")]
    NoChoices,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Decides when the scratchpad should be compacted.
pub trait CompactionTrigger: Send + Sync {
    /// Whether compaction should run now.
    fn should_compact(&self, ctx: &ExecutionContext) -> bool;

    /// Called after a successful compaction so the trigger can rebase
    /// its snapshots.
    fn notify_compacted(&self, ctx: &ExecutionContext);
}

/// Rewrites the context's scratchpad in place.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    /// Compact the scratchpad. On error the scratchpad must be left
    /// unchanged.
    async fn compact(&self, ctx: &ExecutionContext) -> Result<(), CompactError>;
}
