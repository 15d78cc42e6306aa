//! Typed lifecycle events and the per-context synchronous event bus.
//!
//! Delivery is synchronous and in-order per execution context: subscribers
//! run on the publishing task, which lets tests assert exact event
//! sequences. Streaming model output travels through topic subscriptions
//! as [`StreamDelta`]s and is orthogonal to the typed event log.

use crate::context::TerminationReason;
use crate::limit::LimitHit;
use crate::message::Message;
use crate::model::ModelResponse;
use crate::section::Section;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which parser family a parse error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// The whole-response section format failed to parse.
    Format,
    /// A tool-call section failed to parse.
    Toolchain,
    /// A terminal-answer section failed to decode.
    Termination,
    /// A single known section was structurally invalid.
    Section,
}

impl ParseErrorKind {
    /// Stable string form, used to build stat keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::Format => "format",
            ParseErrorKind::Toolchain => "toolchain",
            ParseErrorKind::Termination => "termination",
            ParseErrorKind::Section => "section",
        }
    }
}

/// Fields shared by every event variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    /// Variant name, e.g. `"after_model_call"`.
    pub event_name: String,
    /// Wall-clock time the event was published.
    pub timestamp: DateTime<Utc>,
    /// Context depth: 0 for the root run, +1 per child.
    pub depth: u32,
    /// Iteration counter of the publishing context at publish time.
    pub iteration: u64,
}

/// What a loop step decided, as carried on [`Event::AfterIteration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    /// The loop recorded an iteration and the run continues.
    Continue,
    /// The loop produced a terminal result.
    Terminate,
}

/// Summary of a loop step: the action taken, the observation that becomes
/// part of the next prompt, and the terminal text when terminating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    /// Continue or terminate.
    pub action: LoopAction,
    /// Observation fed back to the model next iteration, if any.
    pub observation: Option<String>,
    /// Terminal text, when `action` is `Terminate`.
    pub terminal: Option<String>,
}

/// A lifecycle event published on an execution context's bus.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The executor is about to start the run.
    BeforeExecution {
        /// Shared fields.
        base: BaseEvent,
    },
    /// The run finished.
    AfterExecution {
        /// Shared fields.
        base: BaseEvent,
        /// Why the run ended.
        reason: TerminationReason,
    },
    /// A loop step is about to execute.
    BeforeIteration {
        /// Shared fields.
        base: BaseEvent,
    },
    /// A loop step finished.
    AfterIteration {
        /// Shared fields.
        base: BaseEvent,
        /// What the step decided.
        outcome: IterationOutcome,
    },
    /// A model call is about to start.
    BeforeModelCall {
        /// Shared fields.
        base: BaseEvent,
        /// Model identifier.
        model: String,
        /// The request messages.
        messages: Vec<Message>,
    },
    /// A model call finished (successfully or not).
    AfterModelCall {
        /// Shared fields.
        base: BaseEvent,
        /// Model identifier.
        model: String,
        /// The response, when the call succeeded.
        response: Option<ModelResponse>,
        /// Input tokens consumed.
        input_tokens: u64,
        /// Output tokens generated.
        output_tokens: u64,
        /// Wall-clock duration of the call.
        duration: Duration,
        /// Error message, when the call failed.
        error: Option<String>,
    },
    /// A tool call is about to start.
    BeforeToolCall {
        /// Shared fields.
        base: BaseEvent,
        /// Tool name.
        tool: String,
        /// Tool arguments.
        args: serde_json::Value,
    },
    /// A tool call finished (successfully or not).
    AfterToolCall {
        /// Shared fields.
        base: BaseEvent,
        /// Tool name.
        tool: String,
        /// Tool arguments.
        args: serde_json::Value,
        /// Tool output, when the call succeeded.
        output: Option<String>,
        /// Wall-clock duration of the call.
        duration: Duration,
        /// Error message, when the call failed.
        error: Option<String>,
    },
    /// A configured limit was met. Terminal for the run.
    LimitExceeded {
        /// Shared fields.
        base: BaseEvent,
        /// The limit, matched key, and observed value.
        hit: LimitHit,
    },
    /// A parser family rejected model output.
    ParseError {
        /// Shared fields.
        base: BaseEvent,
        /// Which parser family.
        kind: ParseErrorKind,
        /// The raw content that failed to parse.
        raw: String,
        /// Parser error message.
        error: String,
    },
    /// A terminal-answer validator is about to run.
    ValidatorCalled {
        /// Shared fields.
        base: BaseEvent,
        /// Validator name.
        name: String,
        /// The decoded answer under validation.
        answer: serde_json::Value,
    },
    /// A terminal-answer validator decided.
    ValidatorResult {
        /// Shared fields.
        base: BaseEvent,
        /// Validator name.
        name: String,
        /// The decoded answer under validation.
        answer: serde_json::Value,
        /// Whether the answer was accepted.
        accepted: bool,
        /// Feedback sections on rejection.
        feedback: Vec<Section>,
    },
    /// A non-classified error worth surfacing to observers.
    Error {
        /// Shared fields.
        base: BaseEvent,
        /// Error message.
        error: String,
    },
}

impl Event {
    /// Shared fields of any variant.
    pub fn base(&self) -> &BaseEvent {
        match self {
            Event::BeforeExecution { base }
            | Event::AfterExecution { base, .. }
            | Event::BeforeIteration { base }
            | Event::AfterIteration { base, .. }
            | Event::BeforeModelCall { base, .. }
            | Event::AfterModelCall { base, .. }
            | Event::BeforeToolCall { base, .. }
            | Event::AfterToolCall { base, .. }
            | Event::LimitExceeded { base, .. }
            | Event::ParseError { base, .. }
            | Event::ValidatorCalled { base, .. }
            | Event::ValidatorResult { base, .. }
            | Event::Error { base, .. } => base,
        }
    }

    /// The variant name, e.g. `"before_iteration"`.
    pub fn name(&self) -> &str {
        &self.base().event_name
    }
}

/// A chunk of streamed model output delivered to topic subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Identifier of the stream this chunk belongs to.
    pub stream_id: String,
    /// Topic label, e.g. `"llm-response"` or `"compaction"`.
    pub topic: String,
    /// The incremental text.
    pub delta: String,
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;
type TopicSubscriber = Arc<dyn Fn(&StreamDelta) + Send + Sync>;

/// In-process publish/subscribe bus owned by one execution context.
///
/// Publishing appends to a replay log and invokes all-events subscribers
/// in registration order, on the publishing task. Publish may be called
/// from any task; a delivery lock serializes it.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    topics: Mutex<HashMap<String, Vec<TopicSubscriber>>>,
    log: Mutex<Vec<Event>>,
    delivery: Mutex<()>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .push(Arc::new(f));
    }

    /// Subscribe to stream deltas published under `topic`.
    pub fn subscribe_topic(&self, topic: impl Into<String>, f: impl Fn(&StreamDelta) + Send + Sync + 'static) {
        self.topics
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.into())
            .or_default()
            .push(Arc::new(f));
    }

    /// Publish an event: log it, then deliver to subscribers in order.
    pub fn publish(&self, event: Event) {
        let subs: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .clone();
        let _serial = self.delivery.lock().expect("bus lock poisoned");
        self.log.lock().expect("bus lock poisoned").push(event.clone());
        for sub in &subs {
            sub(&event);
        }
    }

    /// Publish a stream delta to its topic's subscribers. Deltas are not
    /// logged; the assembled response arrives as an `AfterModelCall`.
    pub fn publish_delta(&self, delta: &StreamDelta) {
        let subs: Vec<TopicSubscriber> = self
            .topics
            .lock()
            .expect("bus lock poisoned")
            .get(&delta.topic)
            .cloned()
            .unwrap_or_default();
        let _serial = self.delivery.lock().expect("bus lock poisoned");
        for sub in &subs {
            sub(delta);
        }
    }

    /// A snapshot of every event published so far, in order.
    pub fn replay(&self) -> Vec<Event> {
        self.log.lock().expect("bus lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base(name: &str) -> BaseEvent {
        BaseEvent {
            event_name: name.into(),
            timestamp: Utc::now(),
            depth: 0,
            iteration: 1,
        }
    }

    #[test]
    fn publish_is_in_order_and_logged() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(move |e| seen2.lock().unwrap().push(e.name().to_string()));

        bus.publish(Event::BeforeIteration {
            base: base("before_iteration"),
        });
        bus.publish(Event::AfterIteration {
            base: base("after_iteration"),
            outcome: IterationOutcome {
                action: LoopAction::Continue,
                observation: None,
                terminal: None,
            },
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["before_iteration".to_string(), "after_iteration".to_string()]
        );
        assert_eq!(bus.replay().len(), 2);
    }

    #[test]
    fn topic_subscribers_only_see_their_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe_topic("llm-response", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_delta(&StreamDelta {
            stream_id: "s1".into(),
            topic: "llm-response".into(),
            delta: "hel".into(),
        });
        bus.publish_delta(&StreamDelta {
            stream_id: "s2".into(),
            topic: "compaction".into(),
            delta: "sum".into(),
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new();
        bus.publish(Event::BeforeIteration {
            base: base("before_iteration"),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::BeforeIteration {
            base: base("before_iteration"),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.replay().len(), 2);
    }

    #[test]
    fn parse_error_kind_strings() {
        assert_eq!(ParseErrorKind::Format.as_str(), "format");
        assert_eq!(ParseErrorKind::Toolchain.as_str(), "toolchain");
        assert_eq!(ParseErrorKind::Termination.as_str(), "termination");
        assert_eq!(ParseErrorKind::Section.as_str(), "section");
    }
}
