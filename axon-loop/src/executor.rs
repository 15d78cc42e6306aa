//! The top-level driver: runs the loop to completion with limit checks at
//! the start of every iteration and compaction between iterations.

use crate::react::{LoopStep, ReactLoop, TerminalCause};
use axon_core::context::{ExecutionContext, TerminationReason};
use axon_core::event::{IterationOutcome, LoopAction};
use axon_core::limit::{Limit, LimitHit};
use axon_core::message::ContentPart;
use axon_compact::{CompactionStrategy, CompactionTrigger};
use std::sync::Arc;
use tracing::{debug, warn};

/// Executor configuration: the root context's name and limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name of the root execution context.
    pub name: String,
    /// Limits installed on the root context, in registration order.
    pub limits: Vec<Limit>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "agent".into(),
            limits: Vec::new(),
        }
    }
}

/// What a finished run produced.
#[derive(Clone)]
pub struct RunReport {
    /// Terminal text (the answer, or a diagnostic for failed runs).
    pub text: String,
    /// Why the run ended.
    pub reason: TerminationReason,
    /// The limit hit, for limit-driven terminations.
    pub limit: Option<LimitHit>,
    /// The run's execution context, for inspecting events and stats.
    pub context: Arc<ExecutionContext>,
}

/// Drives a [`ReactLoop`] to completion.
pub struct AgentExecutor {
    react: ReactLoop,
    trigger: Option<Box<dyn CompactionTrigger>>,
    strategy: Option<Box<dyn CompactionStrategy>>,
    config: ExecutorConfig,
}

impl AgentExecutor {
    /// Create an executor with no compaction and the default config.
    pub fn new(react: ReactLoop) -> Self {
        Self {
            react,
            trigger: None,
            strategy: None,
            config: ExecutorConfig::default(),
        }
    }

    /// Replace the executor configuration.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a compaction trigger/strategy pair, consulted between
    /// iterations.
    pub fn with_compaction(
        mut self,
        trigger: Box<dyn CompactionTrigger>,
        strategy: Box<dyn CompactionStrategy>,
    ) -> Self {
        self.trigger = Some(trigger);
        self.strategy = Some(strategy);
        self
    }

    /// Construct a root context from the config and run to completion.
    pub async fn run(&self, input: Vec<ContentPart>) -> RunReport {
        let ctx = ExecutionContext::root(self.config.name.clone())
            .limits(self.config.limits.iter().cloned())
            .build();
        self.run_with_context(ctx, input).await
    }

    /// Run to completion on a caller-built context (e.g. one wired with
    /// subscribers, a cancellation token, or a parent link).
    pub async fn run_with_context(
        &self,
        ctx: Arc<ExecutionContext>,
        input: Vec<ContentPart>,
    ) -> RunReport {
        ctx.with_loop_data(|data| data.set_original_input(input));
        ctx.publish_before_execution();

        let mut text = String::new();
        let (reason, limit) = loop {
            if ctx.is_cancelled() {
                break (TerminationReason::Cancelled, None);
            }

            ctx.begin_iteration();
            if let Some(hit) = ctx.check_limits() {
                ctx.publish_limit_exceeded(&hit);
                let reason = if hit.matched_key.starts_with("answer_rejected") {
                    TerminationReason::ValidatorRejectedFatal
                } else {
                    TerminationReason::LimitExceeded
                };
                text = format!(
                    "limit exceeded: {} = {} (max {})",
                    hit.matched_key, hit.value, hit.limit.max
                );
                break (reason, Some(hit));
            }

            ctx.publish_before_iteration();
            let step = match self.react.next(&ctx).await {
                Ok(step) => step,
                Err(err) => {
                    warn!(error = %err, "loop step failed");
                    ctx.publish_error(&err.to_string());
                    text = err.to_string();
                    break (TerminationReason::ModelError, None);
                }
            };

            match step {
                LoopStep::Terminate { text: terminal, cause } => {
                    ctx.publish_after_iteration(IterationOutcome {
                        action: LoopAction::Terminate,
                        observation: None,
                        terminal: Some(terminal.clone()),
                    });
                    text = terminal;
                    let reason = match cause {
                        TerminalCause::Answer => TerminationReason::Success,
                        TerminalCause::ModelError => TerminationReason::ModelError,
                        TerminalCause::ParseError => TerminationReason::ParseErrorFatal,
                        TerminalCause::Cancelled => TerminationReason::Cancelled,
                    };
                    break (reason, None);
                }
                LoopStep::Continue { observation } => {
                    ctx.publish_after_iteration(IterationOutcome {
                        action: LoopAction::Continue,
                        observation: Some(observation).filter(|o| !o.is_empty()),
                        terminal: None,
                    });

                    if let (Some(trigger), Some(strategy)) = (&self.trigger, &self.strategy) {
                        if trigger.should_compact(&ctx) {
                            debug!(iteration = ctx.iteration(), "compaction triggered");
                            match strategy.compact(&ctx).await {
                                Ok(()) => trigger.notify_compacted(&ctx),
                                Err(err) => {
                                    warn!(error = %err, "compaction failed, keeping scratchpad");
                                    ctx.publish_error(&format!("compaction failed: {err}"));
                                }
                            }
                        }
                    }
                }
            }
        };

        ctx.record_termination(reason, limit.clone());
        ctx.publish_after_execution(reason);
        RunReport {
            text,
            reason,
            limit,
            context: ctx,
        }
    }
}
