//! Turn finalizer.
//!
//! Runs once per turn after the queue has drained: completes the last
//! assistant row, closes the turn with its latency, then fires the
//! best-effort follow-ups (compaction hook, chat title). If completing the
//! row or the turn fails, the turn is marked errored instead.

use std::sync::Arc;

use async_trait::async_trait;
use scribe_core::{ChatId, MessageStatus, Role, TurnStatus};
use scribe_settings::PipelineSettings;
use tracing::{debug, error, info, warn};

use crate::context::StreamContext;
use crate::errors::{PipelineError, Result};
use crate::store::TranscriptStore;
use crate::title::derive_title;

/// Follow-up work on rows of a completed turn, such as summarization.
#[async_trait]
pub trait CompactionHook: Send + Sync {
    /// Called once per completed turn with every row it wrote.
    async fn on_turn_complete(&self, chat_id: &ChatId, turn_id: i64, message_ids: &[i64]) -> Result<()>;
}

/// A [`CompactionHook`] that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCompaction;

#[async_trait]
impl CompactionHook for NoopCompaction {
    async fn on_turn_complete(&self, _chat_id: &ChatId, _turn_id: i64, _message_ids: &[i64]) -> Result<()> {
        Ok(())
    }
}

/// What a finished turn produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Owning chat.
    pub chat_id: ChatId,
    /// The turn.
    pub turn_id: i64,
    /// All visible text generated during the turn.
    pub final_text: String,
    /// Errors collected while processing and finalizing.
    pub errors: Vec<String>,
    /// Status the turn ended with.
    pub turn_status: TurnStatus,
}

/// Finalize the turn described by `ctx`.
pub async fn finalize_turn(
    store: Arc<dyn TranscriptStore>,
    mut ctx: StreamContext,
    settings: &PipelineSettings,
    compaction: Arc<dyn CompactionHook>,
) -> TurnOutcome {
    let latency_ms = i64::try_from(ctx.started_at.elapsed().as_millis()).unwrap_or(i64::MAX);

    let turn_status = match commit(store.as_ref(), &mut ctx, latency_ms).await {
        Ok(status) => {
            info!(chat_id = %ctx.chat_id, turn_id = ctx.turn_id, %status, latency_ms, "turn finalized");
            spawn_compaction(compaction, &ctx);
            set_title(store.as_ref(), &ctx, settings).await;
            status
        }
        Err(err) => {
            let err = PipelineError::Finalization(err.to_string());
            error!(chat_id = %ctx.chat_id, turn_id = ctx.turn_id, error = %err, "turn finalization failed");
            if let Err(mark) = store.fail_turn(&ctx.chat_id, ctx.turn_id, err.to_string()).await {
                error!(chat_id = %ctx.chat_id, turn_id = ctx.turn_id, error = %mark, "failed to mark turn errored");
            }
            ctx.errors.push(err.to_string());
            TurnStatus::Error
        }
    };

    TurnOutcome {
        chat_id: ctx.chat_id,
        turn_id: ctx.turn_id,
        final_text: ctx.transcript,
        errors: ctx.errors,
        turn_status,
    }
}

/// Complete the last row and the turn.
async fn commit(store: &dyn TranscriptStore, ctx: &mut StreamContext, latency_ms: i64) -> Result<TurnStatus> {
    ctx.close_open_spans();
    let content = ctx.message_content();
    match ctx.message_id {
        Some(message_id) => {
            store
                .update_message(&ctx.chat_id, message_id, content, Some(MessageStatus::Complete))
                .await?;
        }
        None if !content.is_empty() => {
            let row = store
                .insert_message(
                    &ctx.chat_id,
                    ctx.turn_id,
                    Role::Assistant,
                    Some(content),
                    ctx.message_order,
                    MessageStatus::Complete,
                )
                .await?;
            ctx.message_order += 1;
            ctx.note_written(row.message_id);
        }
        None => {}
    }

    for detail in std::mem::take(&mut ctx.unrecorded_errors) {
        if let Err(err) = store.record_turn_error(&ctx.chat_id, ctx.turn_id, detail, false).await {
            warn!(chat_id = %ctx.chat_id, turn_id = ctx.turn_id, error = %err, "could not record turn error");
        }
    }

    let status = if ctx.errors.is_empty() {
        TurnStatus::Complete
    } else {
        TurnStatus::Error
    };
    if !store.complete_turn(&ctx.chat_id, ctx.turn_id, status, latency_ms).await? {
        debug!(chat_id = %ctx.chat_id, turn_id = ctx.turn_id, "turn was already finalized");
    }
    Ok(status)
}

fn spawn_compaction(hook: Arc<dyn CompactionHook>, ctx: &StreamContext) {
    let chat_id = ctx.chat_id.clone();
    let turn_id = ctx.turn_id;
    let message_ids = ctx.written.clone();
    drop(tokio::spawn(async move {
        if let Err(err) = hook.on_turn_complete(&chat_id, turn_id, &message_ids).await {
            warn!(chat_id = %chat_id, turn_id, error = %err, "compaction hook failed");
        }
    }));
}

async fn set_title(store: &dyn TranscriptStore, ctx: &StreamContext, settings: &PipelineSettings) {
    let Some(title) = derive_title(&ctx.transcript, settings.title_max_words, settings.title_max_chars) else {
        return;
    };
    match store.set_title_if_absent(&ctx.chat_id, title).await {
        Ok(true) => debug!(chat_id = %ctx.chat_id, "chat title set"),
        Ok(false) => {}
        Err(err) => warn!(chat_id = %ctx.chat_id, error = %err, "could not set chat title"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
