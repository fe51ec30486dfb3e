// Options for tracer calls

use serde::Serialize;
use serde_json::Value;

use interlace_core::{
    Attachment, ErrorInfo, Outcome, Properties, Sentiment, SignalType, Usage,
};

/// Options for `Tracer::begin`
#[derive(Debug, Clone, Default)]
pub struct BeginOptions {
    /// Interaction event name, e.g. "rag_query"
    pub event: String,
    /// Caller-chosen id; generated when absent
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub input: Option<Value>,
    pub properties: Properties,
    pub attachments: Vec<Attachment>,
}

impl BeginOptions {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Options for `InteractionHandle::finish`
#[derive(Debug, Clone, Default)]
pub struct FinishOptions {
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub properties: Properties,
}

impl FinishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Options mirroring an already computed outcome
    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Output(value) => Self::new().with_output(value),
            Outcome::Error(error) => Self::new().with_error(error),
            Outcome::Empty => Self::new(),
        }
    }

    /// An error wins over an output
    pub(crate) fn outcome(&self) -> Outcome {
        match (&self.error, &self.output) {
            (Some(error), _) => Outcome::Error(error.clone()),
            (None, Some(output)) => Outcome::Output(output.clone()),
            (None, None) => Outcome::Empty,
        }
    }
}

/// Options for `Tracer::track_signal`
#[derive(Debug, Clone, Default)]
pub struct SignalOptions {
    /// Event or interaction the signal refers to
    pub event_id: String,
    /// Free-form name, e.g. "thumbs_up"
    pub name: String,
    pub signal_type: SignalType,
    pub sentiment: Option<Sentiment>,
    pub comment: Option<String>,
    /// Replacement content, for edits
    pub after: Option<String>,
    pub properties: Properties,
}

impl SignalOptions {
    pub fn new(event_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, signal_type: SignalType) -> Self {
        self.signal_type = signal_type;
        self
    }

    pub fn with_sentiment(mut self, sentiment: Sentiment) -> Self {
        self.sentiment = Some(sentiment);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_after(mut self, after: impl Into<String>) -> Self {
        self.after = Some(after.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Options for `Tracer::feedback`
#[derive(Debug, Clone, Default)]
pub struct FeedbackOptions {
    /// Signal name; "feedback" when absent
    pub name: Option<String>,
    /// Score in [0, 1]; at least 0.5 reads as positive
    pub score: Option<f64>,
    /// Explicit sentiment, overriding the score
    pub sentiment: Option<Sentiment>,
    pub comment: Option<String>,
    pub properties: Properties,
}

impl FeedbackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_sentiment(mut self, sentiment: Sentiment) -> Self {
        self.sentiment = Some(sentiment);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub(crate) fn resolved_sentiment(&self) -> Option<Sentiment> {
        self.sentiment.or_else(|| {
            self.score.map(|score| {
                if score >= 0.5 {
                    Sentiment::Positive
                } else {
                    Sentiment::Negative
                }
            })
        })
    }
}

/// Options for `Tracer::track_event`: a completed model call logged by hand
#[derive(Debug, Clone, Default)]
pub struct TrackEventOptions {
    pub name: String,
    pub model: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub usage: Option<Usage>,
    pub error: Option<ErrorInfo>,
    pub properties: Properties,
}

impl TrackEventOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_input(mut self, input: impl Serialize) -> Self {
        self.input = serde_json::to_value(input).ok();
        self
    }

    pub fn with_output(mut self, output: impl Serialize) -> Self {
        self.output = serde_json::to_value(output).ok();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
