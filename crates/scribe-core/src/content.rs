//! Persisted message content.
//!
//! A message body is either plain text or an ordered list of structured
//! parts accumulated while a response streams. Parts the pipeline archives
//! verbatim (files, sources, provider metadata) round-trip through
//! [`ContentPart::Raw`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a structured message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    /// Visible text.
    Text {
        /// The text.
        text: String,
    },
    /// Model reasoning, never shown as visible text.
    Reasoning {
        /// The reasoning text.
        text: String,
    },
    /// Streamed tool arguments.
    ToolInput {
        /// Tool input id.
        id: String,
        /// Tool name, when announced by `tool-input-start`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        /// Parsed JSON when the arguments looked like JSON, else the raw string.
        input: Value,
    },
    /// An in-band provider error.
    Error {
        /// Raw error payload.
        error: Value,
    },
    /// Any other chunk, archived as received.
    #[serde(untagged)]
    Raw(Value),
}

impl ContentPart {
    /// Shorthand for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The visible text of this part, if it has any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A message body: plain text or structured parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Structured parts in emission order.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Collapse a part list into the simplest faithful body: plain text when
    /// every part is text, otherwise the parts themselves.
    pub fn from_parts(parts: Vec<ContentPart>) -> Self {
        if parts.iter().all(|p| p.as_text().is_some()) {
            let text: String = parts.iter().filter_map(ContentPart::as_text).collect();
            Self::Text(text)
        } else {
            Self::Parts(parts)
        }
    }

    /// Concatenated visible text.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.iter().filter_map(ContentPart::as_text).collect(),
        }
    }

    /// Whether there is nothing to persist.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_parts_collapse_to_plain_text() {
        let content = MessageContent::from_parts(vec![ContentPart::text("Hello "), ContentPart::text("world")]);
        assert_eq!(content, MessageContent::Text("Hello world".into()));
    }

    #[test]
    fn mixed_parts_stay_structured() {
        let content = MessageContent::from_parts(vec![
            ContentPart::Reasoning { text: "hmm".into() },
            ContentPart::text("answer"),
        ]);
        assert!(matches!(content, MessageContent::Parts(ref p) if p.len() == 2));
        assert_eq!(content.plain_text(), "answer");
    }

    #[test]
    fn tool_input_serializes_camel_case() {
        let part = ContentPart::ToolInput {
            id: "t1".into(),
            tool_name: Some("lookup".into()),
            input: json!({"q": 1}),
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value, json!({"type": "tool-input", "id": "t1", "toolName": "lookup", "input": {"q": 1}}));
    }

    #[test]
    fn unknown_part_round_trips_as_raw() {
        let raw = json!({"type": "source", "url": "https://example.com"});
        let part: ContentPart = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(part, ContentPart::Raw(raw.clone()));
        assert_eq!(serde_json::to_value(&part).unwrap(), raw);
    }

    #[test]
    fn body_deserializes_from_string_or_array() {
        let text: MessageContent = serde_json::from_value(json!("hi")).unwrap();
        assert_eq!(text, MessageContent::Text("hi".into()));

        let parts: MessageContent = serde_json::from_value(json!([{"type": "text", "text": "hi"}])).unwrap();
        assert_eq!(parts, MessageContent::Parts(vec![ContentPart::text("hi")]));
    }
}
