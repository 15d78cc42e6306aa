#![deny(missing_docs)]
//! Tool interface and registry for axon.
//!
//! Defines the object-safe [`Tool`] trait and [`ToolRegistry`] for
//! managing collections of tools, plus the [`ToolChain`](chain::ToolChain)
//! that owns the `action` section: it parses tool calls out of model
//! output, executes them sequentially, publishes tool events, and builds
//! the observation text for the next iteration.

use async_trait::async_trait;
use axon_core::context::ExecutionContext;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod chain;

pub use chain::{RawToolResults, ToolCall, ToolChain, ToolChainResult};

/// Errors from tool operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool was not found in the registry.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The action section content did not parse into tool calls.
    #[error("tool call parse failed: {0}")]
    Parse(String),

    /// The input provided to the tool was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tool execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The ambient cancellation signal fired.
    #[error("cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Object-safe trait for tool implementations.
///
/// Argument parsing and event publishing are the tool chain's job; a tool
/// receives already-decoded JSON arguments and returns its observation
/// text. Implementations must honor the context's cancellation token for
/// long-running work.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn args_schema(&self) -> serde_json::Value;

    /// Execute the tool.
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        args: serde_json::Value,
    ) -> Result<String, ToolError>;
}

/// Registry of tools available to a run.
///
/// Holds tools as `Arc<dyn Tool>` keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// All registered tools, sorted by name.
    pub fn sorted(&self) -> Vec<&Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by_key(|t| t.name().to_string());
        tools
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
