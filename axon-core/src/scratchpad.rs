//! The scratchpad model: iterations, working memory, and the append-only
//! history.
//!
//! Iterations are immutable once built and shared as `Arc` between the
//! scratchpad and the history, so compaction strategies that keep an
//! iteration keep the *same* iteration, not a copy.

use crate::message::{ContentPart, Message};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Importance score at or above which an iteration is pinned: it survives
/// every compaction untouched.
pub const PIN_IMPORTANCE: f64 = 10.0;

/// Metadata key holding the importance score.
pub const META_IMPORTANCE: &str = "importance_score";
/// Metadata key holding the origin marker.
pub const META_ORIGIN: &str = "origin";

/// Where an iteration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOrigin {
    /// Produced by a loop step.
    Normal,
    /// Produced by a compaction strategy. At most one synthetic iteration
    /// exists in a scratchpad at a time; compaction replaces it.
    CompactedSynthetic,
}

/// One think/act/observe turn: an ordered list of messages plus an opaque
/// metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    messages: Vec<Message>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Iteration {
    /// Create a normal-origin iteration from messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the importance score. Scores `>= PIN_IMPORTANCE` pin the
    /// iteration.
    pub fn with_importance(mut self, score: f64) -> Self {
        self.metadata.insert(
            META_IMPORTANCE.to_string(),
            serde_json::json!(score),
        );
        self
    }

    /// Set the origin marker. Reserved for compaction strategies.
    pub fn with_origin(mut self, origin: IterationOrigin) -> Self {
        self.metadata.insert(
            META_ORIGIN.to_string(),
            serde_json::to_value(origin).expect("origin serializes"),
        );
        self
    }

    /// Attach an arbitrary metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The iteration's messages, in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The metadata map.
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The importance score, if one was set.
    pub fn importance(&self) -> Option<f64> {
        self.metadata.get(META_IMPORTANCE).and_then(|v| v.as_f64())
    }

    /// Whether this iteration is pinned.
    pub fn is_pinned(&self) -> bool {
        self.importance().is_some_and(|s| s >= PIN_IMPORTANCE)
    }

    /// The iteration's origin. Defaults to [`IterationOrigin::Normal`].
    pub fn origin(&self) -> IterationOrigin {
        self.metadata
            .get(META_ORIGIN)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(IterationOrigin::Normal)
    }

    /// Whether this iteration was synthesized by compaction.
    pub fn is_synthetic(&self) -> bool {
        self.origin() == IterationOrigin::CompactedSynthetic
    }

    /// Concatenate the textual content of all messages, dropping binary
    /// parts. Callers that care about non-text parts pin the iteration.
    pub fn joined_text(&self) -> String {
        self.messages
            .iter()
            .map(Message::joined_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The working memory presented to the model: an ordered list of
/// iterations. Appended to after each loop step, rewritten in place by
/// compaction.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    items: Vec<Arc<Iteration>>,
}

impl Scratchpad {
    /// Create an empty scratchpad.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an iteration.
    pub fn append(&mut self, iteration: Arc<Iteration>) {
        self.items.push(iteration);
    }

    /// Replace the whole contents.
    pub fn replace(&mut self, items: Vec<Arc<Iteration>>) {
        self.items = items;
    }

    /// Number of iterations.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the scratchpad is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The iteration at `index`, if any.
    pub fn at(&self, index: usize) -> Option<&Arc<Iteration>> {
        self.items.get(index)
    }

    /// Iterate over the iterations in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Iteration>> {
        self.items.iter()
    }

    /// A clone of the backing list.
    pub fn items(&self) -> Vec<Arc<Iteration>> {
        self.items.clone()
    }
}

/// Per-run record outliving any single loop step: the original input, the
/// scratchpad, and the append-only history of every iteration ever
/// produced. The history is never rewritten.
#[derive(Debug, Clone, Default)]
pub struct LoopData {
    original_input: Vec<ContentPart>,
    scratchpad: Scratchpad,
    history: Vec<Arc<Iteration>>,
}

impl LoopData {
    /// Create loop data for a run with the given original input.
    pub fn new(original_input: Vec<ContentPart>) -> Self {
        Self {
            original_input,
            scratchpad: Scratchpad::new(),
            history: Vec::new(),
        }
    }

    /// The input that started the run.
    pub fn original_input(&self) -> &[ContentPart] {
        &self.original_input
    }

    /// Replace the original input. Used by the executor at run start.
    pub fn set_original_input(&mut self, input: Vec<ContentPart>) {
        self.original_input = input;
    }

    /// The scratchpad.
    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    /// Mutable access to the scratchpad.
    pub fn scratchpad_mut(&mut self) -> &mut Scratchpad {
        &mut self.scratchpad
    }

    /// Replace the scratchpad wholesale.
    pub fn set_scratchpad(&mut self, scratchpad: Scratchpad) {
        self.scratchpad = scratchpad;
    }

    /// Append an iteration to the history log.
    pub fn append_history(&mut self, iteration: Arc<Iteration>) {
        self.history.push(iteration);
    }

    /// The full history, in production order.
    pub fn history(&self) -> &[Arc<Iteration>] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn it(text: &str) -> Iteration {
        Iteration::new(vec![Message::text(Role::Assistant, text)])
    }

    #[test]
    fn default_origin_is_normal_and_unpinned() {
        let iteration = it("a");
        assert_eq!(iteration.origin(), IterationOrigin::Normal);
        assert!(!iteration.is_pinned());
        assert!(!iteration.is_synthetic());
        assert_eq!(iteration.importance(), None);
    }

    #[test]
    fn importance_gates_pinning() {
        assert!(!it("a").with_importance(9.9).is_pinned());
        assert!(it("a").with_importance(PIN_IMPORTANCE).is_pinned());
        assert!(it("a").with_importance(42.0).is_pinned());
    }

    #[test]
    fn synthetic_origin_roundtrips_through_metadata() {
        let iteration = it("summary").with_origin(IterationOrigin::CompactedSynthetic);
        assert!(iteration.is_synthetic());
        let json = serde_json::to_string(&iteration).unwrap();
        let back: Iteration = serde_json::from_str(&json).unwrap();
        assert!(back.is_synthetic());
    }

    #[test]
    fn scratchpad_append_replace_at() {
        let mut pad = Scratchpad::new();
        let a = Arc::new(it("a"));
        let b = Arc::new(it("b"));
        pad.append(a.clone());
        pad.append(b.clone());
        assert_eq!(pad.len(), 2);
        assert!(Arc::ptr_eq(pad.at(0).unwrap(), &a));

        pad.replace(vec![b.clone()]);
        assert_eq!(pad.len(), 1);
        assert!(Arc::ptr_eq(pad.at(0).unwrap(), &b));
    }

    #[test]
    fn history_is_append_only_alongside_scratchpad() {
        let mut data = LoopData::new(vec![ContentPart::text("question")]);
        let a = Arc::new(it("a"));
        data.append_history(a.clone());
        data.scratchpad_mut().append(a.clone());
        data.scratchpad_mut().replace(vec![]);
        assert_eq!(data.history().len(), 1);
        assert!(Arc::ptr_eq(&data.history()[0], &a));
        assert_eq!(data.original_input()[0].as_text(), Some("question"));
    }

    #[test]
    fn joined_text_skips_binary_parts() {
        let iteration = Iteration::new(vec![
            Message::new(
                Role::User,
                vec![
                    ContentPart::text("visible"),
                    ContentPart::Binary {
                        media_type: "application/octet-stream".into(),
                        data: "AA==".into(),
                    },
                ],
            ),
            Message::text(Role::Assistant, "reply"),
        ]);
        assert_eq!(iteration.joined_text(), "visible\nreply");
    }
}
