// Call-shape extraction
//
// Pulls model, input, output and token usage out of provider request and
// response payloads. The strategy is chosen by the capability a client
// declares; unknown shapes fall back to recording the raw payloads.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use interlace_core::Usage;

/// What was recognised in a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFields {
    pub model: Option<String>,
    pub input: Option<Value>,
}

/// What was recognised in a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFields {
    pub model: Option<String>,
    pub output: Option<Value>,
    pub usage: Option<Usage>,
}

/// Extraction strategy for one family of call shapes
pub trait Extractor: Send + Sync {
    /// Event name for calls of this shape
    fn operation(&self) -> &str;

    fn request(&self, request: &Value) -> RequestFields;

    fn response(&self, response: &Value) -> ResponseFields;
}

/// Call shape a client declares
#[derive(Clone, Default)]
pub enum Capability {
    /// `model`, `messages[]`, `choices[].message.content`, `usage.prompt_tokens`
    ChatCompletions,
    /// `model`, `system`, `messages[]`, `content[].text`, `usage.input_tokens`
    Messages,
    /// Serialized request and response recorded as-is
    #[default]
    Raw,
    /// Host-provided strategy
    Custom(Arc<dyn Extractor>),
}

impl Capability {
    pub fn extractor(&self) -> &dyn Extractor {
        match self {
            Capability::ChatCompletions => &ChatCompletionsExtractor,
            Capability::Messages => &MessagesExtractor,
            Capability::Raw => &RawExtractor,
            Capability::Custom(extractor) => extractor.as_ref(),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ChatCompletions => write!(f, "ChatCompletions"),
            Capability::Messages => write!(f, "Messages"),
            Capability::Raw => write!(f, "Raw"),
            Capability::Custom(extractor) => write!(f, "Custom({})", extractor.operation()),
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn token_count(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

// ============================================================================
// Chat completions
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletionsExtractor;

impl Extractor for ChatCompletionsExtractor {
    fn operation(&self) -> &str {
        "chat.completions"
    }

    fn request(&self, request: &Value) -> RequestFields {
        RequestFields {
            model: string_field(request, "model"),
            input: request
                .get("messages")
                .or_else(|| request.get("prompt"))
                .cloned(),
        }
    }

    fn response(&self, response: &Value) -> ResponseFields {
        let message = response.pointer("/choices/0/message");
        let output = match message {
            Some(message) => match message.get("content") {
                Some(Value::String(text)) => Some(Value::String(text.clone())),
                _ => Some(message.clone()),
            },
            None => response.pointer("/choices/0/text").cloned(),
        };

        let usage = response.get("usage").map(|usage| Usage {
            input_tokens: token_count(usage, "prompt_tokens"),
            output_tokens: token_count(usage, "completion_tokens"),
            total_tokens: token_count(usage, "total_tokens"),
        });

        ResponseFields {
            model: string_field(response, "model"),
            output,
            usage: usage.filter(|u| !u.is_empty()),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MessagesExtractor;

impl Extractor for MessagesExtractor {
    fn operation(&self) -> &str {
        "messages"
    }

    fn request(&self, request: &Value) -> RequestFields {
        let messages = request.get("messages").cloned();
        let input = match (request.get("system"), messages) {
            (Some(system), Some(messages)) => Some(serde_json::json!({
                "system": system,
                "messages": messages,
            })),
            (_, messages) => messages,
        };

        RequestFields {
            model: string_field(request, "model"),
            input,
        }
    }

    fn response(&self, response: &Value) -> ResponseFields {
        let output = response.get("content").map(|content| {
            let text: Vec<&str> = content
                .as_array()
                .into_iter()
                .flatten()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                content.clone()
            } else {
                Value::String(text.concat())
            }
        });

        let usage = response.get("usage").map(|usage| {
            Usage::new(
                token_count(usage, "input_tokens"),
                token_count(usage, "output_tokens"),
            )
        });

        ResponseFields {
            model: string_field(response, "model"),
            output,
            usage: usage.filter(|u| !u.is_empty()),
        }
    }
}

// ============================================================================
// Raw fallback
// ============================================================================

/// Records payloads as-is
///
/// A top-level `input`/`prompt` (request) or `output`/`text` (response)
/// field is used directly when present; otherwise the whole payload is
/// recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawExtractor;

impl Extractor for RawExtractor {
    fn operation(&self) -> &str {
        "llm_call"
    }

    fn request(&self, request: &Value) -> RequestFields {
        let input = request
            .get("input")
            .or_else(|| request.get("prompt"))
            .unwrap_or(request);

        RequestFields {
            model: string_field(request, "model"),
            input: (!input.is_null()).then(|| input.clone()),
        }
    }

    fn response(&self, response: &Value) -> ResponseFields {
        let output = response
            .get("output")
            .or_else(|| response.get("text"))
            .unwrap_or(response);

        ResponseFields {
            model: string_field(response, "model"),
            output: (!output.is_null()).then(|| output.clone()),
            usage: None,
        }
    }
}
