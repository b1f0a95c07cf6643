//! The storage seam the pipeline writes through.
//!
//! [`TranscriptStore`] is the async surface the dispatcher and finalizer
//! call. [`SqliteTranscriptStore`] implements it over a shared
//! [`TranscriptDb`], moving every call onto the blocking pool so no `SQLite`
//! work runs on the async executor.

use std::sync::Arc;

use async_trait::async_trait;
use scribe_core::{ChatId, MessageContent, MessageStatus, OwnerId, Role, TurnStatus, Usage};
use scribe_store::{
    AppendMessage, BeginTurn, MessageRow, Result, StoreError, ToolPatch, ToolUpsert, ToolWrite, TranscriptDb,
    TurnStart,
};

/// Who is starting a turn, and with what prompt.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    /// Chat the turn belongs to.
    pub chat_id: ChatId,
    /// Owner recorded when the chat is created.
    pub owner: OwnerId,
    /// The user's prompt, if it should be persisted with the turn.
    pub prompt: Option<String>,
}

/// Async persistence operations used by the pipeline.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Create the chat if needed, open a turn and persist the prompt.
    async fn begin_turn(&self, request: &TurnRequest, first_message_order: i64) -> Result<TurnStart>;

    /// Allocate a message number and insert a non-tool row.
    async fn insert_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        role: Role,
        content: Option<MessageContent>,
        message_order: i64,
        status: MessageStatus,
    ) -> Result<MessageRow>;

    /// Replace a row's body, optionally setting its status.
    async fn update_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        content: MessageContent,
        status: Option<MessageStatus>,
    ) -> Result<()>;

    /// Insert or merge a tool row keyed by correlation id. When no row
    /// carries the id, the id-less tool row `claim` is adopted instead of
    /// inserting.
    async fn upsert_tool_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        provider_id: Option<String>,
        claim: Option<i64>,
        patch: ToolPatch,
        message_order: i64,
    ) -> Result<ToolWrite>;

    /// Merge into a tool row already resolved by message number.
    async fn merge_tool_message(&self, chat_id: &ChatId, message_id: i64, turn_id: i64, patch: ToolPatch)
    -> Result<ToolWrite>;

    /// Record token usage for a turn.
    async fn record_usage(&self, chat_id: &ChatId, turn_id: i64, usage: Usage) -> Result<()>;

    /// Append an error to a turn.
    async fn record_turn_error(&self, chat_id: &ChatId, turn_id: i64, error: String, needs_review: bool) -> Result<()>;

    /// Finalize a turn.
    async fn complete_turn(&self, chat_id: &ChatId, turn_id: i64, status: TurnStatus, latency_ms: i64) -> Result<bool>;

    /// Mark a turn errored.
    async fn fail_turn(&self, chat_id: &ChatId, turn_id: i64, error: String) -> Result<bool>;

    /// Set the chat title unless one exists.
    async fn set_title_if_absent(&self, chat_id: &ChatId, title: String) -> Result<bool>;
}

/// [`TranscriptStore`] backed by `SQLite`.
#[derive(Clone)]
pub struct SqliteTranscriptStore {
    db: Arc<TranscriptDb>,
}

impl SqliteTranscriptStore {
    /// Wrap a shared database.
    pub fn new(db: Arc<TranscriptDb>) -> Self {
        Self { db }
    }

    /// The underlying database, for read-back.
    pub fn db(&self) -> &Arc<TranscriptDb> {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TranscriptDb) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Internal(format!("blocking store task failed: {e}")))?
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn begin_turn(&self, request: &TurnRequest, first_message_order: i64) -> Result<TurnStart> {
        let request = request.clone();
        self.blocking(move |db| {
            let prompt = request.prompt.map(MessageContent::Text);
            db.begin_turn(&BeginTurn {
                chat_id: &request.chat_id,
                owner: &request.owner,
                prompt: prompt.as_ref(),
                first_message_order,
            })
        })
        .await
    }

    async fn insert_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        role: Role,
        content: Option<MessageContent>,
        message_order: i64,
        status: MessageStatus,
    ) -> Result<MessageRow> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| {
            db.insert_message(&AppendMessage {
                chat_id: &chat_id,
                turn_id,
                role,
                content: content.as_ref(),
                message_order,
                status,
            })
        })
        .await
    }

    async fn update_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        content: MessageContent,
        status: Option<MessageStatus>,
    ) -> Result<()> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.update_message(&chat_id, message_id, &content, status))
            .await
    }

    async fn upsert_tool_message(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        provider_id: Option<String>,
        claim: Option<i64>,
        patch: ToolPatch,
        message_order: i64,
    ) -> Result<ToolWrite> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| {
            db.upsert_tool_message(&ToolUpsert {
                chat_id: &chat_id,
                turn_id,
                provider_id: provider_id.as_deref(),
                claim,
                patch: &patch,
                message_order,
            })
        })
        .await
    }

    async fn merge_tool_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        turn_id: i64,
        patch: ToolPatch,
    ) -> Result<ToolWrite> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.merge_tool_message(&chat_id, message_id, turn_id, &patch))
            .await
    }

    async fn record_usage(&self, chat_id: &ChatId, turn_id: i64, usage: Usage) -> Result<()> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.record_usage(&chat_id, turn_id, &usage).map(|_| ()))
            .await
    }

    async fn record_turn_error(&self, chat_id: &ChatId, turn_id: i64, error: String, needs_review: bool) -> Result<()> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| {
            if db.record_turn_error(&chat_id, turn_id, &error, needs_review)? {
                Ok(())
            } else {
                Err(StoreError::TurnNotFound {
                    chat_id: chat_id.to_string(),
                    turn_id,
                })
            }
        })
        .await
    }

    async fn complete_turn(&self, chat_id: &ChatId, turn_id: i64, status: TurnStatus, latency_ms: i64) -> Result<bool> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.complete_turn(&chat_id, turn_id, status, latency_ms))
            .await
    }

    async fn fail_turn(&self, chat_id: &ChatId, turn_id: i64, error: String) -> Result<bool> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.fail_turn(&chat_id, turn_id, &error)).await
    }

    async fn set_title_if_absent(&self, chat_id: &ChatId, title: String) -> Result<bool> {
        let chat_id = chat_id.clone();
        self.blocking(move |db| db.set_title_if_absent(&chat_id, &title)).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn store() -> SqliteTranscriptStore {
        SqliteTranscriptStore::new(Arc::new(TranscriptDb::in_memory().unwrap()))
    }

    fn request(prompt: Option<&str>) -> TurnRequest {
        TurnRequest {
            chat_id: ChatId::from_raw("chat"),
            owner: OwnerId::from("owner"),
            prompt: prompt.map(String::from),
        }
    }

    #[tokio::test]
    async fn begin_turn_persists_prompt() {
        let store = store();
        let start = store.begin_turn(&request(Some("hi")), 1).await.unwrap();
        assert_eq!(start.next_order, 2);

        let rows = store.db().list_messages(&ChatId::from_raw("chat")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, Some(MessageContent::from("hi")));
    }

    #[tokio::test]
    async fn tool_writes_round_trip_through_blocking_pool() {
        let store = store();
        let chat = ChatId::from_raw("chat");
        let start = store.begin_turn(&request(None), 1).await.unwrap();
        let turn = start.turn.turn_id;

        let call = store
            .upsert_tool_message(
                &chat,
                turn,
                Some("t1".into()),
                None,
                ToolPatch::call("lookup", json!({"q": 1})),
                1,
            )
            .await
            .unwrap();
        let result = store
            .merge_tool_message(
                &chat,
                call.row.message_id,
                turn,
                ToolPatch::result("lookup", json!("42"), MessageStatus::Complete),
            )
            .await
            .unwrap();
        assert_eq!(result.row.tool_result, Some(json!("42")));
        assert_eq!(result.row.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn errors_on_unknown_turn_surface() {
        let store = store();
        let _ = store.begin_turn(&request(None), 1).await.unwrap();
        let result = store
            .record_turn_error(&ChatId::from_raw("chat"), 7, "boom".into(), false)
            .await;
        assert_matches!(result, Err(StoreError::TurnNotFound { turn_id: 7, .. }));
    }
}
