//! The execution context: per-run state aggregating stats, events, limits,
//! the iteration counter, parent/child links, and the scratchpad owner.
//!
//! A context is used by a single logical task; the stats store and bus
//! tolerate publishes from streaming callbacks on other tasks. Stat
//! side-effects of the publish helpers propagate to every ancestor, with
//! one exception: the `iterations` counter stays local so a child run
//! cannot disturb its parent's iteration-limit enforcement.

use crate::event::{BaseEvent, Event, EventBus, IterationOutcome, ParseErrorKind};
use crate::limit::{Limit, LimitEvaluator, LimitHit};
use crate::message::Message;
use crate::model::ModelResponse;
use crate::scratchpad::LoopData;
use crate::section::Section;
use crate::stats::{keys, StatsStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a run ended.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The termination handler accepted a final answer.
    Success,
    /// A configured limit fired.
    LimitExceeded,
    /// The model call failed.
    ModelError,
    /// The model response could not be parsed and the loop had nothing
    /// left to feed back.
    ParseErrorFatal,
    /// The cancellation signal fired.
    Cancelled,
    /// The answer-rejection limit fired (a `LimitExceeded` against an
    /// `answer_rejected*` key).
    ValidatorRejectedFatal,
}

/// The recorded end of a run: reason plus the limit hit, when one fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationRecord {
    /// Why the run ended.
    pub reason: TerminationReason,
    /// The limit hit, for limit-driven terminations.
    pub limit: Option<LimitHit>,
}

/// Builder for a root [`ExecutionContext`].
pub struct ContextBuilder {
    name: String,
    limits: Vec<Limit>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    /// Add one limit.
    pub fn limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Add several limits, preserving order.
    pub fn limits(mut self, limits: impl IntoIterator<Item = Limit>) -> Self {
        self.limits.extend(limits);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the root context.
    pub fn build(self) -> Arc<ExecutionContext> {
        Arc::new_cyclic(|me| ExecutionContext {
            me: me.clone(),
            name: self.name,
            depth: 0,
            stats: StatsStore::new(),
            bus: EventBus::new(),
            limits: LimitEvaluator::new(self.limits),
            iteration: AtomicU64::new(0),
            parent: None,
            children: Mutex::new(Vec::new()),
            termination: Mutex::new(None),
            loop_data: Mutex::new(LoopData::default()),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// Per-run mutable state. Created when a run starts, dropped when it
/// finishes. Child contexts are created when a tool recursively invokes a
/// sub-agent.
pub struct ExecutionContext {
    me: Weak<ExecutionContext>,
    name: String,
    depth: u32,
    stats: StatsStore,
    bus: EventBus,
    limits: LimitEvaluator,
    iteration: AtomicU64,
    parent: Option<Arc<ExecutionContext>>,
    children: Mutex<Vec<Weak<ExecutionContext>>>,
    termination: Mutex<Option<TerminationRecord>>,
    loop_data: Mutex<LoopData>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    /// Start building a root context.
    pub fn root(name: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            name: name.into(),
            limits: Vec::new(),
            cancel: None,
        }
    }

    /// Spawn a child context with independent stats, iteration counter,
    /// bus, and scratchpad. The child's cancellation token is derived
    /// from this context's, and its stat updates propagate upward.
    pub fn spawn_child(&self, name: impl Into<String>) -> Arc<ExecutionContext> {
        self.spawn_child_with_limits(name, Vec::new())
    }

    /// [`spawn_child`](Self::spawn_child) with the child's own limits.
    pub fn spawn_child_with_limits(
        &self,
        name: impl Into<String>,
        limits: Vec<Limit>,
    ) -> Arc<ExecutionContext> {
        let parent = self.me.upgrade().expect("context still referenced");
        let child = Arc::new_cyclic(|me| ExecutionContext {
            me: me.clone(),
            name: name.into(),
            depth: self.depth + 1,
            stats: StatsStore::new(),
            bus: EventBus::new(),
            limits: LimitEvaluator::new(limits),
            iteration: AtomicU64::new(0),
            parent: Some(parent),
            children: Mutex::new(Vec::new()),
            termination: Mutex::new(None),
            loop_data: Mutex::new(LoopData::default()),
            cancel: self.cancel.child_token(),
        });
        self.children
            .lock()
            .expect("context lock poisoned")
            .push(Arc::downgrade(&child));
        child
    }

    /// The context's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Depth: 0 for the root, +1 per child level.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The context-local stats store.
    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    /// The context's event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// All events published on this context so far.
    pub fn events(&self) -> Vec<Event> {
        self.bus.replay()
    }

    /// The parent context, if this is a child.
    pub fn parent(&self) -> Option<&Arc<ExecutionContext>> {
        self.parent.as_ref()
    }

    /// Live child contexts.
    pub fn children(&self) -> Vec<Arc<ExecutionContext>> {
        self.children
            .lock()
            .expect("context lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The current iteration count.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    /// Start a new iteration: bump the counter and the (local-only)
    /// `iterations` stat. Returns the new count.
    pub fn begin_iteration(&self) -> u64 {
        let n = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.incr_counter(keys::ITERATIONS, 1);
        n
    }

    /// Evaluate the configured limits against the current stats.
    pub fn check_limits(&self) -> Option<LimitHit> {
        self.limits.check_all(&self.stats)
    }

    /// The configured limit evaluator.
    pub fn limit_evaluator(&self) -> &LimitEvaluator {
        &self.limits
    }

    /// The ambient cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record why the run ended. The first record wins.
    pub fn record_termination(&self, reason: TerminationReason, limit: Option<LimitHit>) {
        let mut slot = self.termination.lock().expect("context lock poisoned");
        if slot.is_none() {
            *slot = Some(TerminationRecord { reason, limit });
        }
    }

    /// The recorded termination, once the run ended.
    pub fn termination(&self) -> Option<TerminationRecord> {
        self.termination.lock().expect("context lock poisoned").clone()
    }

    /// Run `f` with exclusive access to the loop data (scratchpad owner).
    pub fn with_loop_data<R>(&self, f: impl FnOnce(&mut LoopData) -> R) -> R {
        let mut guard = self.loop_data.lock().expect("context lock poisoned");
        f(&mut guard)
    }

    // ── aggregating stat updates ────────────────────────────────────────

    /// Add to a counter here and in every ancestor.
    pub fn add_counter(&self, key: &str, delta: i64) {
        self.stats.incr_counter(key, delta);
        let mut cur = self.parent.clone();
        while let Some(ctx) = cur {
            ctx.stats.incr_counter(key, delta);
            cur = ctx.parent.clone();
        }
    }

    /// Add to a gauge here and in every ancestor.
    pub fn add_gauge(&self, key: &str, delta: f64) {
        self.stats.incr_gauge(key, delta);
        let mut cur = self.parent.clone();
        while let Some(ctx) = cur {
            ctx.stats.incr_gauge(key, delta);
            cur = ctx.parent.clone();
        }
    }

    /// Set a gauge here and in every ancestor.
    pub fn set_gauge(&self, key: &str, value: f64) {
        self.stats.set_gauge(key, value);
        let mut cur = self.parent.clone();
        while let Some(ctx) = cur {
            ctx.stats.set_gauge(key, value);
            cur = ctx.parent.clone();
        }
    }

    /// Reset a gauge here and in every ancestor. Used by the components
    /// that own `*_consecutive` families on every success.
    pub fn reset_gauge(&self, key: &str) {
        self.stats.reset_gauge(key);
        let mut cur = self.parent.clone();
        while let Some(ctx) = cur {
            ctx.stats.reset_gauge(key);
            cur = ctx.parent.clone();
        }
    }

    // ── publish helpers (each updates stats, then delivers) ─────────────

    fn base(&self, event_name: &str) -> BaseEvent {
        BaseEvent {
            event_name: event_name.to_string(),
            timestamp: Utc::now(),
            depth: self.depth,
            iteration: self.iteration(),
        }
    }

    /// Publish `BeforeExecution`.
    pub fn publish_before_execution(&self) {
        self.bus.publish(Event::BeforeExecution {
            base: self.base("before_execution"),
        });
    }

    /// Publish `AfterExecution` with the run's termination reason.
    pub fn publish_after_execution(&self, reason: TerminationReason) {
        self.bus.publish(Event::AfterExecution {
            base: self.base("after_execution"),
            reason,
        });
    }

    /// Publish `BeforeIteration`.
    pub fn publish_before_iteration(&self) {
        self.bus.publish(Event::BeforeIteration {
            base: self.base("before_iteration"),
        });
    }

    /// Publish `AfterIteration` with the loop step's outcome.
    pub fn publish_after_iteration(&self, outcome: IterationOutcome) {
        self.bus.publish(Event::AfterIteration {
            base: self.base("after_iteration"),
            outcome,
        });
    }

    /// Publish `BeforeModelCall`.
    pub fn publish_before_model_call(&self, model: &str, messages: &[Message]) {
        self.bus.publish(Event::BeforeModelCall {
            base: self.base("before_model_call"),
            model: model.to_string(),
            messages: messages.to_vec(),
        });
    }

    /// Publish `AfterModelCall`. Updates token counters (total and
    /// per-model) and the last-iteration token gauge before delivery.
    pub fn publish_after_model_call(
        &self,
        model: &str,
        response: Option<&ModelResponse>,
        duration: Duration,
        error: Option<&str>,
    ) {
        let usage = response.map(|r| r.usage).unwrap_or_default();
        let input = usage.input_tokens as i64;
        let output = usage.output_tokens as i64;
        self.add_counter(keys::INPUT_TOKENS, input);
        self.add_counter(&keys::per_target(keys::INPUT_TOKENS, model), input);
        self.add_counter(keys::OUTPUT_TOKENS, output);
        self.add_counter(&keys::per_target(keys::OUTPUT_TOKENS, model), output);
        self.set_gauge(
            keys::TOTAL_TOKENS_LAST_ITERATION,
            (usage.input_tokens + usage.output_tokens) as f64,
        );

        self.bus.publish(Event::AfterModelCall {
            base: self.base("after_model_call"),
            model: model.to_string(),
            response: response.cloned(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration,
            error: error.map(str::to_string),
        });
    }

    /// Publish `BeforeToolCall`. Updates the total and per-tool call
    /// counters before delivery.
    pub fn publish_before_tool_call(&self, tool: &str, args: &serde_json::Value) {
        self.add_counter(keys::TOOL_CALLS, 1);
        self.add_counter(&keys::per_target(keys::TOOL_CALLS, tool), 1);
        self.bus.publish(Event::BeforeToolCall {
            base: self.base("before_tool_call"),
            tool: tool.to_string(),
            args: args.clone(),
        });
    }

    /// Publish `AfterToolCall`. On error, bumps the error totals and the
    /// global and per-tool consecutive gauges. Success-side resets belong
    /// to the tool chain, which owns those families.
    pub fn publish_after_tool_call(
        &self,
        tool: &str,
        args: &serde_json::Value,
        output: Option<&str>,
        duration: Duration,
        error: Option<&str>,
    ) {
        if error.is_some() {
            self.add_counter(keys::TOOL_CALL_ERROR_TOTAL, 1);
            self.add_counter(&keys::per_target("tool_call_error", tool), 1);
            self.add_gauge(keys::TOOL_CALL_ERROR_CONSECUTIVE, 1.0);
            self.add_gauge(
                &keys::per_target(keys::TOOL_CALL_ERROR_CONSECUTIVE, tool),
                1.0,
            );
        }
        self.bus.publish(Event::AfterToolCall {
            base: self.base("after_tool_call"),
            tool: tool.to_string(),
            args: args.clone(),
            output: output.map(str::to_string),
            duration,
            error: error.map(str::to_string),
        });
    }

    /// Publish `ParseError`. Bumps the family's total counter and
    /// consecutive gauge before delivery.
    pub fn publish_parse_error(&self, kind: ParseErrorKind, raw: &str, error: &str) {
        self.add_counter(&keys::parse_error_total(kind.as_str()), 1);
        self.add_gauge(&keys::parse_error_consecutive(kind.as_str()), 1.0);
        self.bus.publish(Event::ParseError {
            base: self.base("parse_error"),
            kind,
            raw: raw.to_string(),
            error: error.to_string(),
        });
    }

    /// Publish `ValidatorCalled`.
    pub fn publish_validator_called(&self, name: &str, answer: &serde_json::Value) {
        self.bus.publish(Event::ValidatorCalled {
            base: self.base("validator_called"),
            name: name.to_string(),
            answer: answer.clone(),
        });
    }

    /// Publish `ValidatorResult`. On rejection, bumps the total and
    /// per-validator rejection counters before delivery.
    pub fn publish_validator_result(
        &self,
        name: &str,
        answer: &serde_json::Value,
        accepted: bool,
        feedback: &[Section],
    ) {
        if !accepted {
            self.add_counter(keys::ANSWER_REJECTED_TOTAL, 1);
            self.add_counter(&keys::per_target("answer_rejected", name), 1);
        }
        self.bus.publish(Event::ValidatorResult {
            base: self.base("validator_result"),
            name: name.to_string(),
            answer: answer.clone(),
            accepted,
            feedback: feedback.to_vec(),
        });
    }

    /// Publish `LimitExceeded`. Terminal; no stat side-effects.
    pub fn publish_limit_exceeded(&self, hit: &LimitHit) {
        self.bus.publish(Event::LimitExceeded {
            base: self.base("limit_exceeded"),
            hit: hit.clone(),
        });
    }

    /// Publish `Error`.
    pub fn publish_error(&self, error: &str) {
        self.bus.publish(Event::Error {
            base: self.base("error"),
            error: error.to_string(),
        });
    }
}
