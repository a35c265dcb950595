//! The event envelope and its type/source vocabularies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Event type discriminator.
///
/// A closed but extensible vocabulary: known types get a variant, anything
/// else round-trips through [`EventType::Custom`]. [`EventType::Wildcard`]
/// matches any type when used in a listener selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Matches any event type in a listener selector.
    Wildcard,
    /// Configuration changes and privacy updates.
    Configuration,
    /// Application lifecycle (launch, foreground, background).
    Lifecycle,
    /// Events emitted by or addressed to the rules engine.
    RulesEngine,
    /// Identity operations.
    Identity,
    /// Outbound signal (postback/pii) traffic.
    Signal,
    /// Hub housekeeping (shared-state change notifications, booted).
    Hub,
    /// Any type outside the known vocabulary.
    Custom(String),
}

impl EventType {
    /// Returns the canonical string label for this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Wildcard => "*",
            Self::Configuration => "configuration",
            Self::Lifecycle => "lifecycle",
            Self::RulesEngine => "rulesengine",
            Self::Identity => "identity",
            Self::Signal => "signal",
            Self::Hub => "hub",
            Self::Custom(s) => s,
        }
    }

    /// Whether a listener registered with this type accepts `other`.
    pub fn matches(&self, other: &EventType) -> bool {
        *self == Self::Wildcard || self == other
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "*" => Self::Wildcard,
            "configuration" => Self::Configuration,
            "lifecycle" => Self::Lifecycle,
            "rulesengine" => Self::RulesEngine,
            "identity" => Self::Identity,
            "signal" => Self::Signal,
            "hub" => Self::Hub,
            _ => Self::Custom(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> String {
        t.as_str().to_string()
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event source discriminator, the second half of a listener selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventSource {
    /// Matches any source in a listener selector.
    Wildcard,
    /// A request carrying content for an extension to act on.
    RequestContent,
    /// A response carrying content produced by an extension.
    ResponseContent,
    /// An instruction to reset internal state (rules engine reset).
    RequestReset,
    /// A shared-state change notification.
    SharedState,
    /// Any source outside the known vocabulary.
    Custom(String),
}

impl EventSource {
    /// Returns the canonical string label for this source.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Wildcard => "*",
            Self::RequestContent => "requestcontent",
            Self::ResponseContent => "responsecontent",
            Self::RequestReset => "requestreset",
            Self::SharedState => "sharedstate",
            Self::Custom(s) => s,
        }
    }

    /// Whether a listener registered with this source accepts `other`.
    pub fn matches(&self, other: &EventSource) -> bool {
        *self == Self::Wildcard || self == other
    }
}

impl From<String> for EventSource {
    fn from(s: String) -> Self {
        match s.as_str() {
            "*" => Self::Wildcard,
            "requestcontent" => Self::RequestContent,
            "responsecontent" => Self::ResponseContent,
            "requestreset" => Self::RequestReset,
            "sharedstate" => Self::SharedState,
            _ => Self::Custom(s),
        }
    }
}

impl From<EventSource> for String {
    fn from(s: EventSource) -> String {
        s.as_str().to_string()
    }
}

impl From<&str> for EventSource {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, data-bearing message dispatched through the hub.
///
/// Identity (`id`, `name`, `event_type`, `source`, `timestamp`) is fixed at
/// construction. The `data` bag may be replaced by the rules engine between
/// ingress and listener delivery; once delivery begins it is immutable for
/// observers. The hub assigns `seq` exactly once at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    name: String,
    #[serde(rename = "type")]
    event_type: EventType,
    source: EventSource,
    timestamp: DateTime<Utc>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<Uuid>,
    #[serde(default)]
    seq: u64,
}

impl Event {
    /// Creates a new event with a fresh id, the current time, and empty data.
    pub fn new(name: impl Into<String>, event_type: EventType, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            event_type,
            source,
            timestamp: Utc::now(),
            data: Value::Object(Map::new()),
            response_id: None,
            parent_id: None,
            seq: 0,
        }
    }

    /// Replaces the event data. Accepts any JSON value; callers conventionally
    /// pass an object.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Marks this event as a response to `trigger`, for one-shot response
    /// listeners keyed on the trigger's id.
    pub fn response_to(mut self, trigger: &Event) -> Self {
        self.response_id = Some(trigger.id);
        self
    }

    /// Marks `parent` as the event that logically caused this one. Used for
    /// shared-state ordering when dispatching from within rule evaluation.
    pub fn chained_to(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Creation time as epoch milliseconds, the form persisted in queues.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Atomically replaces the data bag. Only the rules engine calls this,
    /// before listener delivery begins.
    pub fn replace_data(&mut self, data: Value) {
        self.data = data;
    }

    pub fn response_id(&self) -> Option<Uuid> {
        self.response_id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// The hub-assigned sequence number; 0 until dispatched.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Assigns the sequence number. Called exactly once, by the hub, at
    /// dispatch.
    pub fn assign_seq(&mut self, seq: u64) {
        self.seq = seq;
    }
}
