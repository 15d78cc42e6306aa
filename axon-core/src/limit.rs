//! Threshold rules evaluated against the stats store.

use crate::stats::StatsStore;
use serde::{Deserialize, Serialize};

/// How a limit's key matches stat keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// The limit key must equal the stat key.
    ExactKey,
    /// The limit key is a prefix of the stat key.
    KeyPrefix,
}

/// A threshold rule: exceeded when a matching stat value reaches `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    /// Matching mode.
    pub kind: LimitKind,
    /// Key or key prefix this limit applies to.
    pub key: String,
    /// Inclusive threshold: exceeded when `value >= max`.
    pub max: f64,
}

impl Limit {
    /// Exact-key limit.
    pub fn exact(key: impl Into<String>, max: f64) -> Self {
        Self {
            kind: LimitKind::ExactKey,
            key: key.into(),
            max,
        }
    }

    /// Key-prefix limit.
    pub fn prefix(key: impl Into<String>, max: f64) -> Self {
        Self {
            kind: LimitKind::KeyPrefix,
            key: key.into(),
            max,
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self.kind {
            LimitKind::ExactKey => key == self.key,
            LimitKind::KeyPrefix => key.starts_with(&self.key),
        }
    }
}

/// The result of a limit firing: which limit, on which key, at what value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitHit {
    /// The configured limit that fired.
    pub limit: Limit,
    /// The stat key that met the threshold.
    pub matched_key: String,
    /// The observed value.
    pub value: f64,
}

/// Evaluates a fixed list of limits against stats snapshots.
///
/// Limits are traversed in registration order; within a prefix limit the
/// key family is scanned in sorted order (the snapshot order), so a run
/// always reports the same hit for the same stats.
#[derive(Debug, Default, Clone)]
pub struct LimitEvaluator {
    limits: Vec<Limit>,
}

impl LimitEvaluator {
    /// Create an evaluator over the given limits.
    pub fn new(limits: Vec<Limit>) -> Self {
        Self { limits }
    }

    /// The configured limits, in registration order.
    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    /// Check every limit against the current stats. Returns the first hit
    /// in registration order, or `None`.
    pub fn check_all(&self, stats: &StatsStore) -> Option<LimitHit> {
        if self.limits.is_empty() {
            return None;
        }
        let counters = stats.counters();
        let gauges = stats.gauges();

        for limit in &self.limits {
            for (key, value) in counters.iter() {
                if limit.matches(key) && *value as f64 >= limit.max {
                    return Some(LimitHit {
                        limit: limit.clone(),
                        matched_key: key.clone(),
                        value: *value as f64,
                    });
                }
            }
            for (key, value) in gauges.iter() {
                if limit.matches(key) && *value >= limit.max {
                    return Some(LimitHit {
                        limit: limit.clone(),
                        matched_key: key.clone(),
                        value: *value,
                    });
                }
            }
        }
        None
    }
}
