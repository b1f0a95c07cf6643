//! Stream dispatcher.
//!
//! Turns one queued event plus the turn's [`StreamContext`] into storage
//! writes. Text, reasoning and tool-input spans are buffered until they end;
//! tool calls and tool results are ordering boundaries, so any buffered
//! content is flushed into its own assistant row before the tool row is
//! touched.

use std::sync::Arc;

use async_trait::async_trait;
use scribe_core::{ContentPart, MessageStatus, Role, StreamChunk, ToolOutput, Usage};
use scribe_store::{ToolPatch, UpsertOutcome};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{SpanKind, StreamContext, parse_tool_input};
use crate::errors::{PipelineError, Result};
use crate::queue::TaskProcessor;
use crate::store::TranscriptStore;

/// A unit of work for the ordered queue.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    /// A chunk from the provider stream.
    Chunk(StreamChunk),
    /// The provider stream yielded an error.
    TransportFailure(String),
}

impl QueueEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::Chunk(chunk) => chunk.kind(),
            Self::TransportFailure(_) => "transport-failure",
        }
    }
}

/// Context state after a task ran.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchSnapshot {
    /// Kind of the event that was processed.
    pub kind: String,
    /// Visible text since the last tool boundary.
    pub text: String,
    /// The pending assistant row, if any.
    pub message_id: Option<i64>,
    /// Next free message order.
    pub message_order: i64,
    /// Structured content since the last tool boundary.
    pub content: Vec<ContentPart>,
}

/// Applies queued events to storage. Owned by the queue worker.
pub struct StreamDispatcher {
    store: Arc<dyn TranscriptStore>,
    ctx: StreamContext,
}

impl StreamDispatcher {
    /// A dispatcher writing `ctx`'s turn through `store`.
    pub fn new(store: Arc<dyn TranscriptStore>, ctx: StreamContext) -> Self {
        Self { store, ctx }
    }

    /// The turn state.
    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    /// Take the store and the final context.
    pub fn into_parts(self) -> (Arc<dyn TranscriptStore>, StreamContext) {
        (self.store, self.ctx)
    }

    /// Process one event.
    pub async fn dispatch(&mut self, event: QueueEvent) -> Result<DispatchSnapshot> {
        let kind = event.kind().to_owned();
        match event {
            QueueEvent::Chunk(chunk) => self.handle_chunk(chunk).await?,
            QueueEvent::TransportFailure(message) => self.on_transport_failure(message).await?,
        }
        Ok(DispatchSnapshot {
            kind,
            text: self.ctx.text.clone(),
            message_id: self.ctx.message_id,
            message_order: self.ctx.message_order,
            content: self.ctx.content.clone(),
        })
    }

    async fn handle_chunk(&mut self, chunk: StreamChunk) -> Result<()> {
        match chunk {
            StreamChunk::TextStart { id } => {
                self.ctx.open_span(SpanKind::Text, &id, None);
                self.reserve_message().await
            }
            StreamChunk::TextDelta { id, delta } => {
                let _ = self.ctx.append_span(SpanKind::Text, &id, &delta);
                self.ctx.push_text(&delta);
                self.reserve_message().await
            }
            StreamChunk::TextEnd { id } => self.end_span(SpanKind::Text, &id).await,
            StreamChunk::ReasoningStart { id } => {
                self.ctx.open_span(SpanKind::Reasoning, &id, None);
                self.reserve_message().await
            }
            StreamChunk::ReasoningDelta { id, delta } => {
                let _ = self.ctx.append_span(SpanKind::Reasoning, &id, &delta);
                self.reserve_message().await
            }
            StreamChunk::ReasoningEnd { id } => self.end_span(SpanKind::Reasoning, &id).await,
            StreamChunk::ToolInputStart { id, tool_name } => {
                self.ctx.open_span(SpanKind::ToolInput, &id, Some(tool_name));
                self.reserve_message().await
            }
            StreamChunk::ToolInputDelta { id, delta } => {
                let _ = self.ctx.append_span(SpanKind::ToolInput, &id, &delta);
                self.reserve_message().await
            }
            StreamChunk::ToolInputEnd { id } => self.end_span(SpanKind::ToolInput, &id).await,
            StreamChunk::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => self.on_tool_call(&tool_call_id, tool_name, &input).await,
            StreamChunk::ToolResult {
                tool_call_id,
                tool_name,
                output,
            } => self.on_tool_result(&tool_call_id, tool_name, &output).await,
            StreamChunk::Finish { usage } => self.on_finish(usage).await,
            StreamChunk::Error { payload } => {
                let payload = Value::Object(payload);
                self.ctx.push_text(&payload.to_string());
                self.ctx.content.push(ContentPart::Error { error: payload });
                Ok(())
            }
            chunk @ (StreamChunk::File { .. }
            | StreamChunk::Source { .. }
            | StreamChunk::Raw { .. }
            | StreamChunk::ResponseMetadata { .. }
            | StreamChunk::StreamStart { .. }) => {
                self.ctx.content.push(ContentPart::Raw(chunk.to_archive_value()));
                Ok(())
            }
            StreamChunk::Unrecognized { kind, payload } => {
                warn!(
                    chat_id = %self.ctx.chat_id,
                    turn_id = self.ctx.turn_id,
                    kind = %kind,
                    "unrecognized chunk kind, keeping it as text"
                );
                self.ctx.push_text(&payload.to_string());
                self.ctx.content.push(ContentPart::Raw(payload));
                Ok(())
            }
        }
    }

    /// Insert a pending assistant row for the buffered content, once.
    async fn reserve_message(&mut self) -> Result<()> {
        if self.ctx.message_id.is_some() {
            return Ok(());
        }
        let row = self
            .store
            .insert_message(
                &self.ctx.chat_id,
                self.ctx.turn_id,
                Role::Assistant,
                None,
                self.ctx.message_order,
                MessageStatus::Pending,
            )
            .await?;
        debug!(
            chat_id = %self.ctx.chat_id,
            turn_id = self.ctx.turn_id,
            message_id = row.message_id,
            message_order = row.message_order,
            "reserved assistant message"
        );
        self.ctx.message_id = Some(row.message_id);
        self.ctx.message_order += 1;
        self.ctx.note_written(row.message_id);
        Ok(())
    }

    async fn end_span(&mut self, kind: SpanKind, id: &str) -> Result<()> {
        if !self.ctx.close_span(kind, id) {
            debug!(span_id = id, ?kind, "end for a span that was never opened");
            return Ok(());
        }
        match self.ctx.message_id {
            Some(message_id) => {
                self.store
                    .update_message(&self.ctx.chat_id, message_id, self.ctx.message_content(), None)
                    .await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Write buffered content into its own completed row and start a new
    /// segment.
    async fn flush_content(&mut self) -> Result<()> {
        self.ctx.close_open_spans();
        let has_content = !self.ctx.content.is_empty() || !self.ctx.text.is_empty();
        match self.ctx.message_id {
            Some(message_id) => {
                self.store
                    .update_message(
                        &self.ctx.chat_id,
                        message_id,
                        self.ctx.message_content(),
                        Some(MessageStatus::Complete),
                    )
                    .await?;
            }
            None if has_content => {
                let row = self
                    .store
                    .insert_message(
                        &self.ctx.chat_id,
                        self.ctx.turn_id,
                        Role::Assistant,
                        Some(self.ctx.message_content()),
                        self.ctx.message_order,
                        MessageStatus::Complete,
                    )
                    .await?;
                self.ctx.message_order += 1;
                self.ctx.note_written(row.message_id);
            }
            None => {}
        }
        self.ctx.reset_buffers();
        Ok(())
    }

    async fn on_tool_call(&mut self, tool_call_id: &str, tool_name: String, input: &str) -> Result<()> {
        self.flush_content().await?;
        let provider_id = non_empty(tool_call_id);
        let patch = ToolPatch::call(tool_name, parse_tool_input(input));
        let write = self
            .store
            .upsert_tool_message(
                &self.ctx.chat_id,
                self.ctx.turn_id,
                provider_id.map(String::from),
                None,
                patch,
                self.ctx.message_order,
            )
            .await?;
        if write.outcome == UpsertOutcome::Inserted {
            self.ctx.message_order += 1;
        }
        self.ctx.remember_tool(provider_id, write.row.message_id);
        self.ctx.note_written(write.row.message_id);
        Ok(())
    }

    async fn on_tool_result(&mut self, tool_call_id: &str, tool_name: String, output: &ToolOutput) -> Result<()> {
        self.flush_content().await?;
        let provider_id = non_empty(tool_call_id);
        let error_detail = output
            .is_error()
            .then(|| format!("tool {tool_name} failed: {}", output.describe()));
        let patch = ToolPatch::result(tool_name, output.to_value(), MessageStatus::Complete);

        // Map first; otherwise storage by provider id, then the id-less row
        // waiting in this turn, then a fresh row.
        let write = match provider_id.and_then(|id| self.ctx.known_tool(id)) {
            Some(message_id) => {
                self.store
                    .merge_tool_message(&self.ctx.chat_id, message_id, self.ctx.turn_id, patch)
                    .await?
            }
            None => {
                let claim = self.ctx.pending_tool();
                let write = self
                    .store
                    .upsert_tool_message(
                        &self.ctx.chat_id,
                        self.ctx.turn_id,
                        provider_id.map(String::from),
                        claim,
                        patch,
                        self.ctx.message_order,
                    )
                    .await?;
                if claim == Some(write.row.message_id) {
                    self.ctx.clear_pending_tool();
                }
                if write.outcome == UpsertOutcome::Inserted {
                    let miss = PipelineError::CorrelationMiss {
                        provider_id: tool_call_id.to_owned(),
                    };
                    warn!(
                        chat_id = %self.ctx.chat_id,
                        turn_id = self.ctx.turn_id,
                        message_id = write.row.message_id,
                        error = %miss,
                        "tool result inserted as a new row"
                    );
                    self.ctx.message_order += 1;
                }
                write
            }
        };
        if provider_id.is_some() {
            self.ctx.remember_tool(provider_id, write.row.message_id);
        }
        self.ctx.note_written(write.row.message_id);

        if let Some(detail) = error_detail {
            self.ctx.errors.push(detail.clone());
            self.store
                .record_turn_error(&self.ctx.chat_id, self.ctx.turn_id, detail, true)
                .await?;
        }
        Ok(())
    }

    async fn on_finish(&mut self, usage: Usage) -> Result<()> {
        let pending = self.ctx.message_id;
        if usage.is_zero() && pending.is_none() {
            debug!(chat_id = %self.ctx.chat_id, turn_id = self.ctx.turn_id, "finish with nothing to record");
            return Ok(());
        }
        self.store
            .record_usage(&self.ctx.chat_id, self.ctx.turn_id, usage)
            .await?;
        if let Some(message_id) = pending {
            self.store
                .update_message(
                    &self.ctx.chat_id,
                    message_id,
                    self.ctx.message_content(),
                    Some(MessageStatus::Complete),
                )
                .await?;
        }
        Ok(())
    }

    async fn on_transport_failure(&mut self, message: String) -> Result<()> {
        warn!(chat_id = %self.ctx.chat_id, turn_id = self.ctx.turn_id, error = %message, "provider stream failed");
        let detail = PipelineError::Transport(message).to_string();
        self.ctx.errors.push(detail.clone());
        self.store
            .record_turn_error(&self.ctx.chat_id, self.ctx.turn_id, detail, false)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for StreamDispatcher {
    type Task = QueueEvent;
    type Output = DispatchSnapshot;

    async fn process(&mut self, task_id: u64, task: QueueEvent) -> Result<DispatchSnapshot> {
        debug!(task_id, kind = task.kind(), turn_id = self.ctx.turn_id, "dispatching");
        self.dispatch(task).await
    }

    fn task_failed(&mut self, task_id: u64, error: &PipelineError) {
        let detail = format!("task {task_id} failed: {error}");
        self.ctx.errors.push(detail.clone());
        self.ctx.unrecorded_errors.push(detail);
    }
}

fn non_empty(id: &str) -> Option<&str> {
    (!id.is_empty()).then_some(id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
