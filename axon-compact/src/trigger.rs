//! Stat-driven compaction triggers.

use crate::CompactionTrigger;
use axon_core::context::ExecutionContext;
use std::collections::HashMap;
use std::sync::Mutex;

/// How a trigger rule matches stat keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    /// Match one key exactly.
    Exact(String),
    /// Match every key with this prefix.
    Prefix(String),
}

impl KeyMatch {
    /// Match one key exactly.
    pub fn exact(key: impl Into<String>) -> Self {
        KeyMatch::Exact(key.into())
    }

    /// Match every key with this prefix.
    pub fn prefix(key: impl Into<String>) -> Self {
        KeyMatch::Prefix(key.into())
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatch::Exact(k) => key == k,
            KeyMatch::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

struct CounterRule {
    keys: KeyMatch,
    delta: i64,
}

struct GaugeRule {
    keys: KeyMatch,
    threshold: f64,
}

/// A trigger composing counter-delta and gauge-threshold rules.
///
/// Counter rules are delta-based: each matched key carries a baseline
/// (initially 0) and the rule fires once the key has grown by at least
/// `delta` since the last [`notify_compacted`](CompactionTrigger::notify_compacted).
/// The notify rebases **every** currently-matching key, including those
/// that did not fire, so a whole family moves together.
///
/// Gauge rules are absolute: they fire while any matching gauge sits at
/// or above the threshold. No baseline — gauges fall on their own after
/// compaction.
#[derive(Default)]
pub struct StatsTrigger {
    counters: Vec<CounterRule>,
    gauges: Vec<GaugeRule>,
    baseline: Mutex<HashMap<String, i64>>,
}

impl StatsTrigger {
    /// Create a trigger with no rules (never fires).
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire when a matching counter grows by at least `delta` since the
    /// last rebase.
    pub fn counter_delta(mut self, keys: KeyMatch, delta: i64) -> Self {
        self.counters.push(CounterRule { keys, delta });
        self
    }

    /// Fire while a matching gauge is at or above `threshold`.
    pub fn gauge_threshold(mut self, keys: KeyMatch, threshold: f64) -> Self {
        self.gauges.push(GaugeRule { keys, threshold });
        self
    }
}

impl CompactionTrigger for StatsTrigger {
    fn should_compact(&self, ctx: &ExecutionContext) -> bool {
        let counters = ctx.stats().counters();
        let baseline = self.baseline.lock().expect("trigger lock poisoned");
        for rule in &self.counters {
            for (key, value) in counters.iter() {
                if !rule.keys.matches(key) {
                    continue;
                }
                let last = baseline.get(key).copied().unwrap_or(0);
                if value - last >= rule.delta {
                    return true;
                }
            }
        }
        drop(baseline);

        let gauges = ctx.stats().gauges();
        for rule in &self.gauges {
            for (key, value) in gauges.iter() {
                if rule.keys.matches(key) && *value >= rule.threshold {
                    return true;
                }
            }
        }
        false
    }

    fn notify_compacted(&self, ctx: &ExecutionContext) {
        let counters = ctx.stats().counters();
        let mut baseline = self.baseline.lock().expect("trigger lock poisoned");
        for rule in &self.counters {
            for (key, value) in counters.iter() {
                if rule.keys.matches(key) {
                    baseline.insert(key.clone(), *value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_delta_fires_and_rebases() {
        let ctx = ExecutionContext::root("run").build();
        let trigger = StatsTrigger::new().counter_delta(KeyMatch::exact("output_tokens"), 100);

        ctx.stats().incr_counter("output_tokens", 60);
        assert!(!trigger.should_compact(&ctx));

        ctx.stats().incr_counter("output_tokens", 60);
        assert!(trigger.should_compact(&ctx));

        trigger.notify_compacted(&ctx);
        assert!(!trigger.should_compact(&ctx));

        ctx.stats().incr_counter("output_tokens", 99);
        assert!(!trigger.should_compact(&ctx));
        ctx.stats().incr_counter("output_tokens", 1);
        assert!(trigger.should_compact(&ctx));
    }

    #[test]
    fn notify_rebases_all_matching_keys() {
        let ctx = ExecutionContext::root("run").build();
        let trigger = StatsTrigger::new().counter_delta(KeyMatch::prefix("tool_calls"), 5);

        ctx.stats().incr_counter("tool_calls:search", 5);
        ctx.stats().incr_counter("tool_calls:fetch", 3);
        assert!(trigger.should_compact(&ctx));

        trigger.notify_compacted(&ctx);
        // fetch was rebased too even though it never fired.
        ctx.stats().incr_counter("tool_calls:fetch", 4);
        assert!(!trigger.should_compact(&ctx));
        ctx.stats().incr_counter("tool_calls:fetch", 1);
        assert!(trigger.should_compact(&ctx));
    }

    #[test]
    fn gauge_threshold_is_absolute() {
        let ctx = ExecutionContext::root("run").build();
        let trigger =
            StatsTrigger::new().gauge_threshold(KeyMatch::exact("scratchpad_len"), 8.0);

        ctx.stats().set_gauge("scratchpad_len", 7.0);
        assert!(!trigger.should_compact(&ctx));
        ctx.stats().set_gauge("scratchpad_len", 8.0);
        assert!(trigger.should_compact(&ctx));

        // Notify does not snapshot gauges: the rule fires again until the
        // gauge itself falls.
        trigger.notify_compacted(&ctx);
        assert!(trigger.should_compact(&ctx));
        ctx.stats().set_gauge("scratchpad_len", 2.0);
        assert!(!trigger.should_compact(&ctx));
    }

    #[test]
    fn empty_trigger_never_fires() {
        let ctx = ExecutionContext::root("run").build();
        ctx.stats().incr_counter("anything", 1_000_000);
        assert!(!StatsTrigger::new().should_compact(&ctx));
    }
}
