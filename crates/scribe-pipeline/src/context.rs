//! Per-turn accumulation state.
//!
//! A [`StreamContext`] is owned by the queue worker for the lifetime of one
//! turn. Handlers get it by `&mut`, so nothing else can observe it half
//! updated.

use std::collections::HashMap;
use std::time::Instant;

use scribe_core::{ChatId, ContentPart, MessageContent};
use serde_json::Value;

/// Correlation-map key for tool rows whose provider id is not known yet.
pub const PENDING_TOOL_KEY: &str = "<pending>";

/// Kind of an open span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpanKind {
    /// Visible text.
    Text,
    /// Model reasoning.
    Reasoning,
    /// Streamed tool arguments.
    ToolInput,
}

/// A span that has started but not ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenSpan {
    /// Buffered fragments.
    pub buffer: String,
    /// Tool name, for tool-input spans.
    pub tool_name: Option<String>,
}

/// Mutable state for one turn.
#[derive(Debug)]
pub struct StreamContext {
    /// Owning chat.
    pub chat_id: ChatId,
    /// Turn being persisted.
    pub turn_id: i64,
    /// When the turn started, for latency.
    pub started_at: Instant,
    /// Visible text accumulated since the last tool boundary.
    pub text: String,
    /// Every visible fragment of the turn, never reset.
    pub transcript: String,
    /// Structured content accumulated since the last tool boundary.
    pub content: Vec<ContentPart>,
    /// Spans that have started but not ended.
    pub spans: HashMap<(SpanKind, String), OpenSpan>,
    /// The pending assistant row, if one is reserved.
    pub message_id: Option<i64>,
    /// Next free message order.
    pub message_order: i64,
    /// Tool rows by correlation id.
    pub tool_calls: HashMap<String, i64>,
    /// Every message row written during the turn, in write order.
    pub written: Vec<i64>,
    /// Errors collected while processing.
    pub errors: Vec<String>,
    /// Errors not yet appended to the stored turn.
    pub unrecorded_errors: Vec<String>,
}

impl StreamContext {
    /// A fresh context for `turn_id` whose first free order is `message_order`.
    pub fn new(chat_id: ChatId, turn_id: i64, message_order: i64) -> Self {
        Self {
            chat_id,
            turn_id,
            started_at: Instant::now(),
            text: String::new(),
            transcript: String::new(),
            content: Vec::new(),
            spans: HashMap::new(),
            message_id: None,
            message_order,
            tool_calls: HashMap::new(),
            written: Vec::new(),
            errors: Vec::new(),
            unrecorded_errors: Vec::new(),
        }
    }

    /// Append visible text to both accumulators.
    pub fn push_text(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.transcript.push_str(fragment);
    }

    /// Append to the buffer of span `id`, opening it if needed. Returns
    /// `true` when the span was newly opened.
    pub fn append_span(&mut self, kind: SpanKind, id: &str, fragment: &str) -> bool {
        let key = (kind, id.to_owned());
        let opened = !self.spans.contains_key(&key);
        self.spans.entry(key).or_default().buffer.push_str(fragment);
        opened
    }

    /// Open span `id`. An already open span keeps its buffer.
    pub fn open_span(&mut self, kind: SpanKind, id: &str, tool_name: Option<String>) {
        let span = self.spans.entry((kind, id.to_owned())).or_default();
        if tool_name.is_some() {
            span.tool_name = tool_name;
        }
    }

    /// Close span `id`, moving its buffer into the structured content.
    /// Returns `false` if no such span was open.
    pub fn close_span(&mut self, kind: SpanKind, id: &str) -> bool {
        let Some(span) = self.spans.remove(&(kind, id.to_owned())) else {
            return false;
        };
        self.content.push(span_to_part(kind, id, span));
        true
    }

    /// Close every open span, in a stable order.
    pub fn close_open_spans(&mut self) {
        let mut open: Vec<_> = self.spans.drain().collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        for ((kind, id), span) in open {
            self.content.push(span_to_part(kind, &id, span));
        }
    }

    /// The row body for the buffered content.
    pub fn message_content(&self) -> MessageContent {
        if self.content.is_empty() {
            MessageContent::Text(self.text.clone())
        } else {
            MessageContent::from_parts(self.content.clone())
        }
    }

    /// Drop buffered content after it has been written to its own row.
    pub fn reset_buffers(&mut self) {
        self.text.clear();
        self.content.clear();
        self.message_id = None;
    }

    /// Remember the row for a correlation id.
    pub fn remember_tool(&mut self, provider_id: Option<&str>, message_id: i64) {
        let key = provider_id.unwrap_or(PENDING_TOOL_KEY).to_owned();
        let _ = self.tool_calls.insert(key, message_id);
    }

    /// The row remembered under a provider id.
    pub fn known_tool(&self, provider_id: &str) -> Option<i64> {
        self.tool_calls.get(provider_id).copied()
    }

    /// The row of a tool call that arrived without an id, if one is waiting.
    pub fn pending_tool(&self) -> Option<i64> {
        self.tool_calls.get(PENDING_TOOL_KEY).copied()
    }

    /// Forget the id-less tool row once a result has been matched to it.
    pub fn clear_pending_tool(&mut self) {
        let _ = self.tool_calls.remove(PENDING_TOOL_KEY);
    }

    /// Record a written row.
    pub fn note_written(&mut self, message_id: i64) {
        if !self.written.contains(&message_id) {
            self.written.push(message_id);
        }
    }
}

/// Parse raw tool arguments: JSON when the text looks like an object or
/// array, the raw string otherwise.
pub fn parse_tool_input(raw: &str) -> Value {
    let trimmed = raw.trim();
    let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if looks_structured {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(raw.to_owned())
}

fn span_to_part(kind: SpanKind, id: &str, span: OpenSpan) -> ContentPart {
    match kind {
        SpanKind::Text => ContentPart::Text { text: span.buffer },
        SpanKind::Reasoning => ContentPart::Reasoning { text: span.buffer },
        SpanKind::ToolInput => ContentPart::ToolInput {
            id: id.to_owned(),
            tool_name: span.tool_name,
            input: parse_tool_input(&span.buffer),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
