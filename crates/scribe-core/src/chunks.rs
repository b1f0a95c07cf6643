//! Stream chunks emitted by a provider while a response is generated.
//!
//! The wire format is a JSON object discriminated by a kebab-case `type` tag
//! with camelCase fields (`{"type":"tool-call","toolCallId":"t1",...}`).
//! Every kind is a variant of [`StreamChunk`] so dispatch is an exhaustive
//! match; kinds this crate does not know are kept as
//! [`StreamChunk::Unrecognized`] instead of being dropped.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One discrete event from a provider stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StreamChunk {
    /// A text span opened.
    TextStart {
        /// Span id.
        id: String,
    },
    /// More text for an open span.
    TextDelta {
        /// Span id.
        id: String,
        /// Text fragment.
        delta: String,
    },
    /// A text span closed.
    TextEnd {
        /// Span id.
        id: String,
    },
    /// A reasoning span opened.
    ReasoningStart {
        /// Span id.
        id: String,
    },
    /// More reasoning for an open span.
    ReasoningDelta {
        /// Span id.
        id: String,
        /// Reasoning fragment.
        delta: String,
    },
    /// A reasoning span closed.
    ReasoningEnd {
        /// Span id.
        id: String,
    },
    /// Tool arguments started streaming.
    ToolInputStart {
        /// Tool input id (matches the eventual `toolCallId`).
        id: String,
        /// Name of the tool being invoked.
        tool_name: String,
    },
    /// A fragment of raw tool arguments.
    ToolInputDelta {
        /// Tool input id.
        id: String,
        /// Raw argument text fragment.
        delta: String,
    },
    /// Tool arguments finished streaming.
    ToolInputEnd {
        /// Tool input id.
        id: String,
    },
    /// A complete tool invocation.
    ToolCall {
        /// Correlation id linking the call to its result.
        tool_call_id: String,
        /// Name of the invoked tool.
        tool_name: String,
        /// Raw stringified arguments.
        #[serde(deserialize_with = "string_or_json")]
        input: String,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        /// Correlation id of the originating call.
        tool_call_id: String,
        /// Name of the invoked tool.
        tool_name: String,
        /// Tagged output value.
        output: ToolOutput,
    },
    /// The provider finished the response.
    Finish {
        /// Token counters for the response.
        #[serde(default)]
        usage: Usage,
    },
    /// The provider reported an in-band error.
    Error {
        /// Raw error payload (every field except `type`).
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    /// A file produced by the model.
    File {
        /// Raw payload.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// A cited source.
    Source {
        /// Raw payload.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// Provider-specific raw chunk.
    Raw {
        /// Raw payload.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// Response-level metadata (model id, timestamps).
    ResponseMetadata {
        /// Raw payload.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// The provider opened the stream.
    StreamStart {
        /// Raw payload.
        #[serde(flatten)]
        data: Map<String, Value>,
    },
    /// A kind this crate does not know about, kept verbatim.
    #[serde(skip)]
    Unrecognized {
        /// The `type` tag as received.
        kind: String,
        /// The whole chunk object.
        payload: Value,
    },
}

impl StreamChunk {
    /// Parse a JSON chunk, mapping unknown or malformed kinds to
    /// [`StreamChunk::Unrecognized`].
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(chunk) => chunk,
            Err(_) => Self::Unrecognized {
                kind: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<missing>")
                    .to_owned(),
                payload: value,
            },
        }
    }

    /// The wire `type` tag of this chunk.
    pub fn kind(&self) -> &str {
        match self {
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputEnd { .. } => "tool-input-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
            Self::File { .. } => "file",
            Self::Source { .. } => "source",
            Self::Raw { .. } => "raw",
            Self::ResponseMetadata { .. } => "response-metadata",
            Self::StreamStart { .. } => "stream-start",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    /// The chunk as a JSON object, suitable for archiving verbatim.
    pub fn to_archive_value(&self) -> Value {
        if let Self::Unrecognized { payload, .. } = self {
            return payload.clone();
        }
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "type": self.kind() }))
    }
}

/// Tagged tool output (`{"type": "...", "value": ...}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ToolOutput {
    /// Plain text output.
    Text(String),
    /// Structured JSON output.
    Json(Value),
    /// Multi-part content output.
    Content(Value),
    /// The tool failed with a structured error.
    ErrorJson(Value),
    /// The tool failed with a text error.
    ErrorText(String),
}

impl ToolOutput {
    /// Whether the output reports a tool failure.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorJson(_) | Self::ErrorText(_))
    }

    /// The output value as JSON, dropping the tag.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) | Self::ErrorText(text) => Value::String(text.clone()),
            Self::Json(value) | Self::Content(value) | Self::ErrorJson(value) => value.clone(),
        }
    }

    /// Human-readable rendering, used for turn error lists.
    pub fn describe(&self) -> String {
        match self {
            Self::Text(text) | Self::ErrorText(text) => text.clone(),
            Self::Json(value) | Self::Content(value) | Self::ErrorJson(value) => value.to_string(),
        }
    }
}

/// Token counters reported on `finish`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    /// Prompt tokens.
    #[serde(deserialize_with = "null_as_zero")]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(deserialize_with = "null_as_zero")]
    pub output_tokens: u64,
    /// Total tokens as reported by the provider.
    #[serde(deserialize_with = "null_as_zero")]
    pub total_tokens: u64,
}

impl Usage {
    /// Build a usage record from raw counters.
    pub fn new(input_tokens: u64, output_tokens: u64, total_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Whether every counter is zero.
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Providers disagree on whether tool-call input is a string or an object;
/// normalize to the raw string form.
fn string_or_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
