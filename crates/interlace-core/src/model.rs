// Event Tree Model
//
// The records the tracer produces: interactions (root grouping nodes),
// events/spans (LLM, tool and task operations), signals (feedback that
// references an event by id) and attachments (rich content on a node).
//
// These are plain data. Structural rules that span several nodes (open
// parents, call-order siblings) live in `tree.rs`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{Result, TracerError};

/// Free-form key/value properties carried by interactions, events and signals
pub type Properties = HashMap<String, Value>;

/// Generate a new time-ordered node id
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ============================================================================
// Outcome / ErrorInfo
// ============================================================================

/// Error recorded on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error kind (type name, `cancelled`, ...)
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

impl ErrorInfo {
    /// Kind used when the underlying operation was cancelled
    pub const CANCELLED: &'static str = "cancelled";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Error for an operation whose future was dropped before completion
    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "operation cancelled before completion")
    }

    /// Build from any displayable error, using its short type name as the kind
    pub fn from_error<E: std::fmt::Display + ?Sized>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let kind = full.rsplit("::").next().unwrap_or(full);
        Self::new(kind, err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == Self::CANCELLED
    }
}

/// How a node finished
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed with an output value
    Output(Value),
    /// Failed with an error
    Error(ErrorInfo),
    /// Completed without a recorded output
    Empty,
}

impl Outcome {
    pub fn output(value: impl Into<Value>) -> Self {
        Outcome::Output(value.into())
    }

    pub fn error(info: ErrorInfo) -> Self {
        Outcome::Error(info)
    }

    pub fn cancelled() -> Self {
        Outcome::Error(ErrorInfo::cancelled())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

// ============================================================================
// Attachment
// ============================================================================

/// Kind of rich content carried by an attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Code,
    Text,
    Image,
    Iframe,
    #[serde(untagged)]
    Other(String),
}

/// Whether the attachment describes what went in or what came out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentRole {
    Input,
    Output,
}

/// Rich content attached to an event or interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub attachment_type: AttachmentType,
    pub role: AttachmentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline content or a URI
    pub value: String,
}

impl Attachment {
    pub fn new(
        attachment_type: AttachmentType,
        role: AttachmentRole,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attachment_type,
            role,
            language: None,
            name: None,
            value: value.into(),
        }
    }

    /// Source code attachment
    pub fn code(
        role: AttachmentRole,
        language: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(AttachmentType::Code, role, value).with_language(language)
    }

    /// Plain text attachment
    pub fn text(role: AttachmentRole, value: impl Into<String>) -> Self {
        Self::new(AttachmentType::Text, role, value)
    }

    /// Image attachment (URL or data URI)
    pub fn image(role: AttachmentRole, uri: impl Into<String>) -> Self {
        Self::new(AttachmentType::Image, role, uri)
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ============================================================================
// Event
// ============================================================================

/// Kind of operation an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Llm,
    Tool,
    Task,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Tool => write!(f, "tool"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// Token usage reported by a model response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl Usage {
    pub fn new(input_tokens: Option<u32>, output_tokens: Option<u32>) -> Self {
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(i), Some(o)) => Some(i.saturating_add(o)),
            _ => None,
        };
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// A single operation record: an LLM call, a tool call or a task
///
/// A span is an event whose `parent_id` points at another event rather than
/// at the interaction root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Root interaction this event belongs to
    pub interaction_id: String,
    /// Interaction id or another event id
    pub parent_id: String,
    pub kind: EventKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Event>,
}

impl Event {
    /// Open a new event under `parent_id`
    pub fn new(
        kind: EventKind,
        name: impl Into<String>,
        parent_id: impl Into<String>,
        interaction_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            interaction_id: interaction_id.into(),
            parent_id: parent_id.into(),
            kind,
            name: name.into(),
            model: None,
            input: None,
            output: None,
            usage: None,
            started_at: Utc::now(),
            ended_at: None,
            latency_ms: None,
            error: None,
            properties: Properties::new(),
            attachments: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Whether the event is a span nested under another event
    pub fn is_span(&self) -> bool {
        self.parent_id != self.interaction_id
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the event with its outcome
    ///
    /// The closing timestamp never precedes the opening one. Closing twice
    /// fails with `AlreadyClosed` and leaves the event untouched.
    pub fn close(&mut self, outcome: Outcome) -> Result<()> {
        if self.is_closed() {
            return Err(TracerError::already_closed(&self.id));
        }

        let ended_at = Utc::now().max(self.started_at);
        let latency = (ended_at - self.started_at).num_milliseconds().max(0);
        self.ended_at = Some(ended_at);
        self.latency_ms = Some(latency as u64);

        match outcome {
            Outcome::Output(value) => self.output = Some(value),
            Outcome::Error(info) => self.error = Some(info),
            Outcome::Empty => {}
        }
        Ok(())
    }

    /// Depth-first iterator over this event and all nested children
    pub fn walk(&self) -> Vec<&Event> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

// ============================================================================
// Interaction
// ============================================================================

/// Root grouping node for one logical user-facing operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Event name, e.g. "rag_query"
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Direct children in call order
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Interaction {
    pub fn new(event: impl Into<String>) -> Self {
        Self::with_id(new_id(), event)
    }

    /// Create with a caller-chosen id (e.g. an id already shown to the end user)
    pub fn with_id(id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            ended_at: None,
            user_id: None,
            event: event.into(),
            input: None,
            output: None,
            error: None,
            properties: Properties::new(),
            attachments: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the interaction; fails with `AlreadyClosed` the second time
    pub fn close(&mut self, outcome: Outcome) -> Result<()> {
        if self.is_closed() {
            return Err(TracerError::already_closed(&self.id));
        }
        self.ended_at = Some(Utc::now().max(self.created_at));
        match outcome {
            Outcome::Output(value) => self.output = Some(value),
            Outcome::Error(info) => self.error = Some(info),
            Outcome::Empty => {}
        }
        Ok(())
    }

    /// All events in the tree, depth-first in call order
    pub fn all_events(&self) -> Vec<&Event> {
        self.events.iter().flat_map(|e| e.walk()).collect()
    }

    /// Find an event anywhere in the tree
    pub fn find_event(&self, id: &str) -> Option<&Event> {
        self.all_events().into_iter().find(|e| e.id == id)
    }
}

// ============================================================================
// Signal
// ============================================================================

/// Signal category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    #[default]
    Default,
    Feedback,
    Edit,
}

/// Sentiment carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    Positive,
    Negative,
}

/// Feedback attached to a previously recorded event by id
///
/// Signals are append-only and never mutate the event they reference; they
/// may arrive long after that event has been delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub event_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Replacement content, for edits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(event_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            event_id: event_id.into(),
            name: name.into(),
            signal_type: SignalType::Default,
            sentiment: None,
            comment: None,
            after: None,
            properties: Properties::new(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// UserIdentity
// ============================================================================

/// Traits associated with a user id via `identify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub traits: Properties,
    pub timestamp: DateTime<Utc>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, traits: Properties) -> Self {
        Self {
            user_id: user_id.into(),
            traits,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_close_records_output_and_latency() {
        let mut event = Event::new(EventKind::Llm, "chat", "int-1", "int-1").with_model("gpt-4o");
        event.close(Outcome::output("A")).unwrap();

        assert!(event.is_closed());
        assert_eq!(event.output, Some(json!("A")));
        assert!(event.ended_at.unwrap() >= event.started_at);
        assert!(event.latency_ms.is_some());
        assert!(!event.is_span());
    }

    #[test]
    fn test_event_close_twice_fails() {
        let mut event = Event::new(EventKind::Tool, "search", "int-1", "int-1");
        event.close(Outcome::Empty).unwrap();
        let first_end = event.ended_at;

        let err = event
            .close(Outcome::error(ErrorInfo::new("Io", "late")))
            .unwrap_err();
        assert_eq!(err, TracerError::already_closed(&event.id));
        assert_eq!(event.ended_at, first_end);
        assert!(event.error.is_none());
    }

    #[test]
    fn test_interaction_close_twice_fails() {
        let mut interaction = Interaction::new("rag_query");
        interaction.close(Outcome::output("A")).unwrap();
        assert!(interaction.close(Outcome::Empty).is_err());
        assert_eq!(interaction.output, Some(json!("A")));
    }

    #[test]
    fn test_error_info_from_error_uses_short_type_name() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.kind, "Error");
        assert_eq!(info.message, "disk full");
        assert!(ErrorInfo::cancelled().is_cancelled());
    }

    #[test]
    fn test_sentiment_and_signal_wire_format() {
        let mut signal = Signal::new("evt-1", "thumbs_up");
        signal.signal_type = SignalType::Feedback;
        signal.sentiment = Some(Sentiment::Positive);

        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["type"], "feedback");
        assert_eq!(value["sentiment"], "POSITIVE");
        assert_eq!(value["event_id"], "evt-1");
        assert!(value.get("comment").is_none());
    }

    #[test]
    fn test_attachment_type_other_round_trips() {
        let attachment = Attachment::new(
            AttachmentType::Other("audio".to_string()),
            AttachmentRole::Output,
            "https://example.com/a.wav",
        );
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value["type"], "audio");

        let code = Attachment::code(AttachmentRole::Input, "python", "print(1)");
        let value = serde_json::to_value(&code).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["language"], "python");
        let parsed: Attachment = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.attachment_type, AttachmentType::Code);
    }

    #[test]
    fn test_usage_total() {
        assert_eq!(Usage::new(Some(10), Some(5)).total_tokens, Some(15));
        assert_eq!(Usage::new(Some(10), None).total_tokens, None);
        assert!(Usage::default().is_empty());
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = Usage::new(Some(u32::MAX), Some(1));
        assert_eq!(usage.total_tokens, Some(u32::MAX));
        assert_eq!(usage.input_tokens, Some(u32::MAX));
    }
}
