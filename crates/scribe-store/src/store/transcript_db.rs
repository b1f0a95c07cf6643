//! High-level transactional `TranscriptDb` API.
//!
//! Composes the repositories into the writes the pipeline needs. Every write
//! runs in one transaction; writes that read before they write (turn
//! creation, message allocation, tool upserts, imports) take the write lock
//! up front with `BEGIN IMMEDIATE` so concurrent turns on the same chat are
//! serialized.

use std::path::Path;

use rusqlite::{Connection, TransactionBehavior};
use scribe_core::{ChatId, MessageContent, MessageStatus, OwnerId, Role, TurnStatus, Usage};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::{Result, StoreError};
use crate::history::{ImportAction, ImportMessage, ImportReport, plan_import};
use crate::merge::{ToolPatch, ToolState, merge_tool_fields};
use crate::sqlite::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::sqlite::migrations::run_migrations;
use crate::sqlite::repositories::chat::ChatRepo;
use crate::sqlite::repositories::message::{MessageRepo, NewMessage};
use crate::sqlite::repositories::sequence::{SequenceRepo, SequenceScope};
use crate::sqlite::repositories::token_usage::TokenUsageRepo;
use crate::sqlite::repositories::turn::TurnRepo;
use crate::sqlite::row_types::{ChatRow, MODIFIED_TURN_KEY, MessageRow, TokenUsageRow, TurnRow};

/// Input for [`TranscriptDb::begin_turn`].
#[derive(Clone, Debug)]
pub struct BeginTurn<'a> {
    /// Chat to open the turn in; created if absent.
    pub chat_id: &'a ChatId,
    /// Owner recorded on a newly created chat.
    pub owner: &'a OwnerId,
    /// The user's prompt, persisted as the turn's first row.
    pub prompt: Option<&'a MessageContent>,
    /// Message order given to the prompt row.
    pub first_message_order: i64,
}

/// Result of [`TranscriptDb::begin_turn`].
#[derive(Clone, Debug)]
pub struct TurnStart {
    /// The chat, as stored.
    pub chat: ChatRow,
    /// The new turn.
    pub turn: TurnRow,
    /// Message number of the prompt row, if one was written.
    pub prompt_message_id: Option<i64>,
    /// First message order free for the response.
    pub next_order: i64,
}

/// Input for [`TranscriptDb::insert_message`].
#[derive(Clone, Debug)]
pub struct AppendMessage<'a> {
    /// Owning chat.
    pub chat_id: &'a ChatId,
    /// Owning turn.
    pub turn_id: i64,
    /// Author role.
    pub role: Role,
    /// Body.
    pub content: Option<&'a MessageContent>,
    /// Position within the turn.
    pub message_order: i64,
    /// Initial status.
    pub status: MessageStatus,
}

/// Input for [`TranscriptDb::upsert_tool_message`].
#[derive(Clone, Debug)]
pub struct ToolUpsert<'a> {
    /// Owning chat.
    pub chat_id: &'a ChatId,
    /// Turn the write comes from.
    pub turn_id: i64,
    /// Correlation id.
    pub provider_id: Option<&'a str>,
    /// An id-less tool row to adopt when no row carries `provider_id` yet.
    /// With neither, a new row is inserted.
    pub claim: Option<i64>,
    /// Fields to write.
    pub patch: &'a ToolPatch,
    /// Position for a freshly inserted row.
    pub message_order: i64,
}

/// How a tool write landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row matched; a new one was inserted.
    Inserted,
    /// An existing row was changed.
    Updated,
    /// An existing row matched and the merge law left it untouched.
    Unchanged,
}

/// Result of a tool upsert or merge.
#[derive(Clone, Debug)]
pub struct ToolWrite {
    /// What happened.
    pub outcome: UpsertOutcome,
    /// The row after the write.
    pub row: MessageRow,
}

/// High-level transcript store wrapping a connection pool.
pub struct TranscriptDb {
    pool: ConnectionPool,
}

impl TranscriptDb {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &Path, config: &ConnectionConfig) -> Result<Self> {
        let db = Self::new(connection::new_file(path, config)?);
        db.migrate()?;
        info!(path = %path.display(), "transcript database ready");
        Ok(db)
    }

    /// A migrated in-memory database.
    pub fn in_memory() -> Result<Self> {
        let db = Self::new(connection::new_in_memory(&ConnectionConfig::default())?);
        db.migrate()?;
        Ok(db)
    }

    /// Apply pending migrations.
    pub fn migrate(&self) -> Result<u32> {
        run_migrations(&*self.conn()?)
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    fn immediate<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Turn lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Open a new turn: create the chat if needed, allocate the turn number,
    /// and persist the prompt.
    pub fn begin_turn(&self, req: &BeginTurn<'_>) -> Result<TurnStart> {
        self.immediate(|tx| {
            let chat = ChatRepo::get_or_create(tx, req.chat_id, req.owner)?;
            let turn_id = SequenceRepo::next(tx, SequenceScope::Turns, req.chat_id, None)?;
            let turn = TurnRepo::create(tx, req.chat_id, turn_id)?;

            let mut next_order = req.first_message_order;
            let prompt_message_id = match req.prompt {
                Some(prompt) => {
                    let message_id = SequenceRepo::next(tx, SequenceScope::Messages, req.chat_id, Some(turn_id))?;
                    let _ = MessageRepo::insert(
                        tx,
                        &NewMessage {
                            chat_id: req.chat_id,
                            turn_id,
                            message_id,
                            role: Role::User,
                            content: Some(prompt),
                            tool_name: None,
                            function_call: None,
                            tool_result: None,
                            provider_id: None,
                            metadata: Value::Object(Map::new()),
                            message_order: next_order,
                            status: MessageStatus::Complete,
                        },
                    )?;
                    next_order += 1;
                    Some(message_id)
                }
                None => None,
            };

            debug!(chat_id = %req.chat_id, turn_id, "turn started");
            Ok(TurnStart {
                chat,
                turn,
                prompt_message_id,
                next_order,
            })
        })
    }

    /// Append an error to the turn, optionally flagging it for review.
    pub fn record_turn_error(&self, chat_id: &ChatId, turn_id: i64, error: &str, needs_review: bool) -> Result<bool> {
        TurnRepo::append_error(&*self.conn()?, chat_id, turn_id, error, needs_review)
    }

    /// Finalize a turn. Returns `false` if it was already finalized.
    pub fn complete_turn(&self, chat_id: &ChatId, turn_id: i64, status: TurnStatus, latency_ms: i64) -> Result<bool> {
        let done = TurnRepo::complete(&*self.conn()?, chat_id, turn_id, status, latency_ms)?;
        if done {
            debug!(chat_id = %chat_id, turn_id, %status, latency_ms, "turn finalized");
        }
        Ok(done)
    }

    /// Mark a turn errored with `error`.
    pub fn fail_turn(&self, chat_id: &ChatId, turn_id: i64, error: &str) -> Result<bool> {
        TurnRepo::fail(&*self.conn()?, chat_id, turn_id, error)
    }

    /// Record token usage for a turn.
    pub fn record_usage(&self, chat_id: &ChatId, turn_id: i64, usage: &Usage) -> Result<TokenUsageRow> {
        TokenUsageRepo::upsert(&*self.conn()?, chat_id, turn_id, usage)
    }

    /// Set the chat title unless one exists.
    pub fn set_title_if_absent(&self, chat_id: &ChatId, title: &str) -> Result<bool> {
        ChatRepo::set_title_if_absent(&*self.conn()?, chat_id, title)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sequence allocation
    // ─────────────────────────────────────────────────────────────────────

    /// Allocate `count` contiguous ids from a per-chat counter.
    pub fn allocate_scoped_ids(
        &self,
        scope: SequenceScope,
        chat_id: &ChatId,
        turn_id: Option<i64>,
        count: u32,
    ) -> Result<Vec<i64>> {
        SequenceRepo::allocate(&*self.conn()?, scope, chat_id, turn_id, count)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Allocate a message number and insert a non-tool row.
    pub fn insert_message(&self, req: &AppendMessage<'_>) -> Result<MessageRow> {
        self.immediate(|tx| {
            ensure_turn_open(tx, req.chat_id, req.turn_id)?;
            let message_id = SequenceRepo::next(tx, SequenceScope::Messages, req.chat_id, Some(req.turn_id))?;
            MessageRepo::insert(
                tx,
                &NewMessage {
                    chat_id: req.chat_id,
                    turn_id: req.turn_id,
                    message_id,
                    role: req.role,
                    content: req.content,
                    tool_name: None,
                    function_call: None,
                    tool_result: None,
                    provider_id: None,
                    metadata: Value::Object(Map::new()),
                    message_order: req.message_order,
                    status: req.status,
                },
            )
        })
    }

    /// Replace a row's body, optionally completing it. Rows of a finalized
    /// turn are frozen.
    pub fn update_message(
        &self,
        chat_id: &ChatId,
        message_id: i64,
        content: &MessageContent,
        status: Option<MessageStatus>,
    ) -> Result<()> {
        self.immediate(|tx| {
            let row = MessageRepo::get(tx, chat_id, message_id)?.ok_or_else(|| StoreError::MessageNotFound {
                chat_id: chat_id.to_string(),
                message_id,
            })?;
            ensure_turn_open(tx, chat_id, row.turn_id)?;
            let _ = MessageRepo::update_content(tx, chat_id, message_id, content, status)?;
            Ok(())
        })
    }

    /// The tool row for a correlation id, if any.
    pub fn find_tool_message(&self, chat_id: &ChatId, provider_id: &str) -> Result<Option<MessageRow>> {
        MessageRepo::find_tool_by_provider(&*self.conn()?, chat_id, provider_id)
    }

    /// Insert or merge a tool row keyed by correlation id, atomically. A row
    /// already carrying the id wins over `claim`; a claimed row is stamped
    /// with the id.
    pub fn upsert_tool_message(&self, req: &ToolUpsert<'_>) -> Result<ToolWrite> {
        let write = self.immediate(|tx| upsert_tool(tx, req))?;
        debug!(
            chat_id = %req.chat_id,
            turn_id = req.turn_id,
            provider_id = req.provider_id.unwrap_or(""),
            message_id = write.row.message_id,
            outcome = ?write.outcome,
            "tool upsert"
        );
        Ok(write)
    }

    /// Merge a patch into a tool row already resolved by message number.
    pub fn merge_tool_message(&self, chat_id: &ChatId, message_id: i64, turn_id: i64, patch: &ToolPatch) -> Result<ToolWrite> {
        self.immediate(|tx| {
            let row = MessageRepo::get(tx, chat_id, message_id)?.ok_or_else(|| StoreError::MessageNotFound {
                chat_id: chat_id.to_string(),
                message_id,
            })?;
            if row.role != Role::Tool {
                return Err(StoreError::InvalidOperation(format!(
                    "message {message_id} is a {} row, not a tool row",
                    row.role
                )));
            }
            merge_into(tx, row, patch, turn_id)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // History import
    // ─────────────────────────────────────────────────────────────────────

    /// Import a caller-supplied history into `turn_id`, skipping entries that
    /// are already persisted and merging tool entries by correlation id. The
    /// turn must still be open.
    pub fn import_history(
        &self,
        chat_id: &ChatId,
        turn_id: i64,
        messages: &[ImportMessage],
        first_message_order: i64,
    ) -> Result<ImportReport> {
        let report = self.immediate(|tx| {
            ensure_turn_open(tx, chat_id, turn_id)?;
            let existing = MessageRepo::list_by_chat(tx, chat_id)?;
            let plan = plan_import(&existing, messages);
            let mut order = MessageRepo::next_order(tx, chat_id, turn_id, first_message_order)?;
            let mut report = ImportReport::default();

            for (msg, action) in messages.iter().zip(plan) {
                match action {
                    ImportAction::Skip => report.skipped += 1,
                    ImportAction::Insert => {
                        let message_id = SequenceRepo::next(tx, SequenceScope::Messages, chat_id, Some(turn_id))?;
                        let _ = MessageRepo::insert(
                            tx,
                            &NewMessage {
                                chat_id,
                                turn_id,
                                message_id,
                                role: msg.role,
                                content: Some(&msg.content),
                                tool_name: msg.tool_name.as_deref(),
                                function_call: msg.function_call.as_ref(),
                                tool_result: msg.tool_result.as_ref(),
                                provider_id: None,
                                metadata: Value::Object(Map::new()),
                                message_order: order,
                                status: MessageStatus::Complete,
                            },
                        )?;
                        order += 1;
                        report.inserted += 1;
                    }
                    ImportAction::UpsertTool => {
                        let patch = ToolPatch {
                            tool_name: msg.tool_name.clone(),
                            function_call: msg.function_call.clone(),
                            tool_result: msg.tool_result.clone(),
                            status: msg.tool_status(),
                        };
                        let write = upsert_tool(
                            tx,
                            &ToolUpsert {
                                chat_id,
                                turn_id,
                                provider_id: msg.provider_id.as_deref(),
                                claim: None,
                                patch: &patch,
                                message_order: order,
                            },
                        )?;
                        match write.outcome {
                            UpsertOutcome::Inserted => {
                                order += 1;
                                report.inserted += 1;
                            }
                            UpsertOutcome::Updated => report.merged += 1,
                            UpsertOutcome::Unchanged => report.skipped += 1,
                        }
                    }
                }
            }
            Ok(report)
        })?;
        info!(
            chat_id = %chat_id,
            turn_id,
            inserted = report.inserted,
            merged = report.merged,
            skipped = report.skipped,
            "history imported"
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read-back
    // ─────────────────────────────────────────────────────────────────────

    /// Get a chat.
    pub fn get_chat(&self, chat_id: &ChatId) -> Result<Option<ChatRow>> {
        ChatRepo::get(&*self.conn()?, chat_id)
    }

    /// Get a turn.
    pub fn get_turn(&self, chat_id: &ChatId, turn_id: i64) -> Result<Option<TurnRow>> {
        TurnRepo::get(&*self.conn()?, chat_id, turn_id)
    }

    /// All turns of a chat.
    pub fn list_turns(&self, chat_id: &ChatId) -> Result<Vec<TurnRow>> {
        TurnRepo::list(&*self.conn()?, chat_id)
    }

    /// Get a message.
    pub fn get_message(&self, chat_id: &ChatId, message_id: i64) -> Result<Option<MessageRow>> {
        MessageRepo::get(&*self.conn()?, chat_id, message_id)
    }

    /// The whole transcript of a chat, ordered by turn then message order.
    pub fn list_messages(&self, chat_id: &ChatId) -> Result<Vec<MessageRow>> {
        MessageRepo::list_by_chat(&*self.conn()?, chat_id)
    }

    /// Token usage recorded for a turn.
    pub fn token_usage(&self, chat_id: &ChatId, turn_id: i64) -> Result<Option<TokenUsageRow>> {
        TokenUsageRepo::get(&*self.conn()?, chat_id, turn_id)
    }
}

fn ensure_turn_open(conn: &Connection, chat_id: &ChatId, turn_id: i64) -> Result<()> {
    if TurnRepo::is_open(conn, chat_id, turn_id)? {
        return Ok(());
    }
    match TurnRepo::get(conn, chat_id, turn_id)? {
        Some(_) => Err(StoreError::InvalidOperation(format!(
            "turn {chat_id}/{turn_id} is finalized; its messages are frozen"
        ))),
        None => Err(StoreError::TurnNotFound {
            chat_id: chat_id.to_string(),
            turn_id,
        }),
    }
}

fn upsert_tool(conn: &Connection, req: &ToolUpsert<'_>) -> Result<ToolWrite> {
    let provider_id = req.provider_id.filter(|id| !id.is_empty());
    if let Some(id) = provider_id {
        if let Some(row) = MessageRepo::find_tool_by_provider(conn, req.chat_id, id)? {
            return merge_into(conn, row, req.patch, req.turn_id);
        }
    }
    if let Some(message_id) = req.claim {
        if let Some(write) = claim_tool(conn, req, message_id, provider_id)? {
            return Ok(write);
        }
    }

    let message_id = SequenceRepo::next(conn, SequenceScope::Messages, req.chat_id, Some(req.turn_id))?;
    let mut metadata = Map::new();
    let _ = metadata.insert(MODIFIED_TURN_KEY.to_string(), Value::from(req.turn_id));
    let row = MessageRepo::insert(
        conn,
        &NewMessage {
            chat_id: req.chat_id,
            turn_id: req.turn_id,
            message_id,
            role: Role::Tool,
            content: None,
            tool_name: req.patch.tool_name.as_deref(),
            function_call: req.patch.function_call.as_ref(),
            tool_result: req.patch.tool_result.as_ref(),
            provider_id,
            metadata: Value::Object(metadata),
            message_order: req.message_order,
            status: req.patch.status,
        },
    )?;
    Ok(ToolWrite {
        outcome: UpsertOutcome::Inserted,
        row,
    })
}

/// Adopt the id-less tool row `message_id`, stamping `provider_id` on it.
/// `None` if the row is gone, not a tool row, or already has an id.
fn claim_tool(conn: &Connection, req: &ToolUpsert<'_>, message_id: i64, provider_id: Option<&str>) -> Result<Option<ToolWrite>> {
    let Some(mut row) = MessageRepo::get(conn, req.chat_id, message_id)? else {
        return Ok(None);
    };
    if row.role != Role::Tool || row.provider_id.is_some() {
        return Ok(None);
    }
    let mut stamped = false;
    if let Some(id) = provider_id {
        stamped = MessageRepo::set_provider_id(conn, req.chat_id, message_id, id)?;
        row.provider_id = Some(id.to_owned());
    }
    let mut write = merge_into(conn, row, req.patch, req.turn_id)?;
    if stamped && write.outcome == UpsertOutcome::Unchanged {
        write.outcome = UpsertOutcome::Updated;
    }
    Ok(Some(write))
}

fn merge_into(conn: &Connection, row: MessageRow, patch: &ToolPatch, turn_id: i64) -> Result<ToolWrite> {
    let Some(next) = merge_tool_fields(&ToolState::from(&row), patch, turn_id) else {
        return Ok(ToolWrite {
            outcome: UpsertOutcome::Unchanged,
            row,
        });
    };
    MessageRepo::write_tool_state(conn, &row, &next)?;
    let row = MessageRepo::get(conn, &row.chat_id, row.message_id)?.ok_or_else(|| StoreError::MessageNotFound {
        chat_id: row.chat_id.to_string(),
        message_id: row.message_id,
    })?;
    Ok(ToolWrite {
        outcome: UpsertOutcome::Updated,
        row,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
