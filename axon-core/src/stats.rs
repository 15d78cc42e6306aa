//! Per-run statistics: monotonic counters and settable gauges.
//!
//! Counters and gauges live in separate maps under the same dotted key
//! space; a key used as a counter is never read back as a gauge. Snapshots
//! are detached copies in sorted order, which is what makes prefix scans
//! over a key family deterministic.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Well-known stat keys and key-family helpers.
pub mod keys {
    /// Counter: loop iterations executed (local to a context, never
    /// aggregated upward).
    pub const ITERATIONS: &str = "iterations";

    /// Counter: total input tokens across all model calls.
    pub const INPUT_TOKENS: &str = "input_tokens";
    /// Counter: total output tokens across all model calls.
    pub const OUTPUT_TOKENS: &str = "output_tokens";
    /// Gauge: input + output tokens of the most recent model call.
    pub const TOTAL_TOKENS_LAST_ITERATION: &str = "total_tokens_last_iteration";

    /// Counter: total tool calls.
    pub const TOOL_CALLS: &str = "tool_calls";
    /// Counter: total failed tool calls.
    pub const TOOL_CALL_ERROR_TOTAL: &str = "tool_call_error_total";
    /// Gauge: consecutive failed tool calls (reset on any success).
    pub const TOOL_CALL_ERROR_CONSECUTIVE: &str = "tool_call_error_consecutive";

    /// Counter: total rejected terminal answers.
    pub const ANSWER_REJECTED_TOTAL: &str = "answer_rejected_total";

    /// Per-target key within a family, e.g. `tool_calls:search` or
    /// `input_tokens:claude-x`.
    pub fn per_target(family: &str, target: &str) -> String {
        format!("{family}:{target}")
    }

    /// Total-counter key for a parse-error family (`format`, `toolchain`,
    /// `termination`, `section`).
    pub fn parse_error_total(kind: &str) -> String {
        format!("{kind}_parse_error_total")
    }

    /// Consecutive-gauge key for a parse-error family.
    pub fn parse_error_consecutive(kind: &str) -> String {
        format!("{kind}_parse_error_consecutive")
    }
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<String, i64>,
    gauges: BTreeMap<String, f64>,
}

/// Concurrent-safe store of counters and gauges for one execution context.
///
/// A read snapshot never observes a torn update; mutating the store while
/// iterating a snapshot does not disturb the iterator.
#[derive(Default)]
pub struct StatsStore {
    inner: Mutex<Inner>,
}

impl StatsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` (>= 0) to a counter, creating it at 0 first if absent.
    pub fn incr_counter(&self, key: &str, delta: i64) {
        debug_assert!(delta >= 0, "counters are monotonic");
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        *inner.counters.entry(key.to_string()).or_insert(0) += delta.max(0);
    }

    /// Read a counter. Absent keys read as 0.
    pub fn get_counter(&self, key: &str) -> i64 {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.counters.get(key).copied().unwrap_or(0)
    }

    /// Reset a counter to 0. Used for explicit rebasing of consecutive
    /// error families; ordinary counters stay monotonic.
    pub fn reset_counter(&self, key: &str) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.counters.insert(key.to_string(), 0);
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, key: &str, value: f64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.insert(key.to_string(), value);
    }

    /// Add `delta` to a gauge, creating it at 0 first if absent.
    pub fn incr_gauge(&self, key: &str, delta: f64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        *inner.gauges.entry(key.to_string()).or_insert(0.0) += delta;
    }

    /// Read a gauge. Absent keys read as 0.
    pub fn get_gauge(&self, key: &str) -> f64 {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.get(key).copied().unwrap_or(0.0)
    }

    /// Reset a gauge to 0.
    pub fn reset_gauge(&self, key: &str) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.insert(key.to_string(), 0.0);
    }

    /// Detached snapshot of all counters, in sorted key order.
    pub fn counters(&self) -> BTreeMap<String, i64> {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.counters.clone()
    }

    /// Detached snapshot of all gauges, in sorted key order.
    pub fn gauges(&self) -> BTreeMap<String, f64> {
        let inner = self.inner.lock().expect("stats lock poisoned");
        inner.gauges.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_keys_read_zero() {
        let stats = StatsStore::new();
        assert_eq!(stats.get_counter("nope"), 0);
        assert_eq!(stats.get_gauge("nope"), 0.0);
    }

    #[test]
    fn counter_accumulates_and_resets() {
        let stats = StatsStore::new();
        stats.incr_counter("tool_calls", 1);
        stats.incr_counter("tool_calls", 2);
        assert_eq!(stats.get_counter("tool_calls"), 3);
        stats.reset_counter("tool_calls");
        assert_eq!(stats.get_counter("tool_calls"), 0);
    }

    #[test]
    fn gauge_set_incr_reset() {
        let stats = StatsStore::new();
        stats.set_gauge("g", 2.5);
        stats.incr_gauge("g", 1.0);
        assert_eq!(stats.get_gauge("g"), 3.5);
        stats.reset_gauge("g");
        assert_eq!(stats.get_gauge("g"), 0.0);
    }

    #[test]
    fn counters_and_gauges_are_separate_families() {
        let stats = StatsStore::new();
        stats.incr_counter("k", 5);
        assert_eq!(stats.get_gauge("k"), 0.0);
        stats.set_gauge("k", 1.0);
        assert_eq!(stats.get_counter("k"), 5);
    }

    #[test]
    fn snapshot_is_detached() {
        let stats = StatsStore::new();
        stats.incr_counter("a", 1);
        let snap = stats.counters();
        stats.incr_counter("a", 1);
        assert_eq!(snap["a"], 1);
        assert_eq!(stats.get_counter("a"), 2);
    }

    #[test]
    fn key_helpers() {
        assert_eq!(keys::per_target("tool_calls", "search"), "tool_calls:search");
        assert_eq!(keys::parse_error_total("format"), "format_parse_error_total");
        assert_eq!(
            keys::parse_error_consecutive("toolchain"),
            "toolchain_parse_error_consecutive"
        );
    }
}
