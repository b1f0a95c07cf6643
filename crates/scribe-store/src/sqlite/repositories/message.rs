//! Message repository: insert, lookup and in-place updates of message rows.

use rusqlite::{Connection, params};
use scribe_core::{ChatId, MessageContent, MessageStatus, Role};
use serde_json::Value;

use crate::errors::{Result, StoreError};
use crate::merge::ToolState;
use crate::sqlite::row_helpers as rh;
use crate::sqlite::row_types::{MODIFIED_TURN_KEY, MessageRow};

const SELECT_MESSAGE: &str = "SELECT chat_id, turn_id, message_id, role, content, tool_name, function_call,
                                     tool_result, provider_id, metadata, message_order, status_id,
                                     created_at, updated_at
                              FROM messages";

/// A row to insert. The message number must already be allocated.
#[derive(Clone, Debug)]
pub struct NewMessage<'a> {
    /// Owning chat.
    pub chat_id: &'a ChatId,
    /// Owning turn.
    pub turn_id: i64,
    /// Allocated message number.
    pub message_id: i64,
    /// Author role.
    pub role: Role,
    /// Body.
    pub content: Option<&'a MessageContent>,
    /// Tool name.
    pub tool_name: Option<&'a str>,
    /// Parsed tool arguments.
    pub function_call: Option<&'a Value>,
    /// Tool output.
    pub tool_result: Option<&'a Value>,
    /// Correlation id.
    pub provider_id: Option<&'a str>,
    /// Metadata object.
    pub metadata: Value,
    /// Position within the turn.
    pub message_order: i64,
    /// Initial status.
    pub status: MessageStatus,
}

/// Message repository. Stateless; every method takes `&Connection`.
pub struct MessageRepo;

impl MessageRepo {
    /// Insert a row.
    pub fn insert(conn: &Connection, msg: &NewMessage<'_>) -> Result<MessageRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO messages (chat_id, turn_id, message_id, role, content, tool_name, function_call,
                                   tool_result, provider_id, metadata, message_order, status_id,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                msg.chat_id.as_str(),
                msg.turn_id,
                msg.message_id,
                msg.role.as_str(),
                rh::to_json_opt(msg.content)?,
                msg.tool_name,
                rh::to_json_opt(msg.function_call)?,
                rh::to_json_opt(msg.tool_result)?,
                msg.provider_id,
                serde_json::to_string(&msg.metadata)?,
                msg.message_order,
                msg.status.as_id(),
                now,
            ],
        )?;
        Ok(MessageRow {
            chat_id: msg.chat_id.clone(),
            turn_id: msg.turn_id,
            message_id: msg.message_id,
            role: msg.role,
            content: msg.content.cloned(),
            tool_name: msg.tool_name.map(String::from),
            function_call: msg.function_call.cloned(),
            tool_result: msg.tool_result.cloned(),
            provider_id: msg.provider_id.map(String::from),
            metadata: msg.metadata.clone(),
            message_order: msg.message_order,
            status: msg.status,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Get a row by message number.
    pub fn get(conn: &Connection, chat_id: &ChatId, message_id: i64) -> Result<Option<MessageRow>> {
        let mut stmt = conn.prepare(&format!("{SELECT_MESSAGE} WHERE chat_id = ?1 AND message_id = ?2"))?;
        let mut rows = stmt.query(params![chat_id.as_str(), message_id])?;
        rows.next()?.map(Self::map_row).transpose()
    }

    /// Find the tool row for a correlation id.
    pub fn find_tool_by_provider(conn: &Connection, chat_id: &ChatId, provider_id: &str) -> Result<Option<MessageRow>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_MESSAGE} WHERE chat_id = ?1 AND role = 'tool' AND provider_id = ?2"
        ))?;
        let mut rows = stmt.query(params![chat_id.as_str(), provider_id])?;
        rows.next()?.map(Self::map_row).transpose()
    }

    /// All rows of a chat in transcript order.
    pub fn list_by_chat(conn: &Connection, chat_id: &ChatId) -> Result<Vec<MessageRow>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_MESSAGE} WHERE chat_id = ?1 ORDER BY turn_id, message_order, message_id"
        ))?;
        Self::collect(stmt.query(params![chat_id.as_str()])?)
    }

    /// The next free message order within a turn.
    pub fn next_order(conn: &Connection, chat_id: &ChatId, turn_id: i64, floor: i64) -> Result<i64> {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(message_order) FROM messages WHERE chat_id = ?1 AND turn_id = ?2",
            params![chat_id.as_str(), turn_id],
            |row| row.get(0),
        )?;
        Ok(max.map_or(floor, |m| (m + 1).max(floor)))
    }

    /// Replace the body, optionally setting the status. Terminal statuses are
    /// never regressed.
    pub fn update_content(
        conn: &Connection,
        chat_id: &ChatId,
        message_id: i64,
        content: &MessageContent,
        status: Option<MessageStatus>,
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE messages
             SET content = ?3,
                 status_id = CASE WHEN ?4 IS NULL OR status_id <> 1 THEN status_id ELSE ?4 END,
                 updated_at = ?5
             WHERE chat_id = ?1 AND message_id = ?2",
            params![
                chat_id.as_str(),
                message_id,
                serde_json::to_string(content)?,
                status.map(MessageStatus::as_id),
                now,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Give an id-less tool row its correlation id. Returns `false` if the
    /// row is not a tool row or already carries an id.
    pub fn set_provider_id(conn: &Connection, chat_id: &ChatId, message_id: i64, provider_id: &str) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE messages SET provider_id = ?3, updated_at = ?4
             WHERE chat_id = ?1 AND message_id = ?2 AND role = 'tool' AND provider_id IS NULL",
            params![chat_id.as_str(), message_id, provider_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Persist a merged tool state onto an existing row, stamping
    /// `metadata.modifiedTurnId`.
    pub fn write_tool_state(conn: &Connection, row: &MessageRow, state: &ToolState) -> Result<()> {
        let mut metadata = match &row.metadata {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(turn) = state.modified_turn_id {
            let _ = metadata.insert(MODIFIED_TURN_KEY.to_string(), Value::from(turn));
        }
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE messages
             SET tool_name = ?3, function_call = ?4, tool_result = ?5, status_id = ?6,
                 metadata = ?7, updated_at = ?8
             WHERE chat_id = ?1 AND message_id = ?2",
            params![
                row.chat_id.as_str(),
                row.message_id,
                state.tool_name,
                rh::to_json_opt(state.function_call.as_ref())?,
                rh::to_json_opt(state.tool_result.as_ref())?,
                state.status.as_id(),
                serde_json::to_string(&Value::Object(metadata))?,
                now,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound {
                chat_id: row.chat_id.to_string(),
                message_id: row.message_id,
            });
        }
        Ok(())
    }

    fn collect(mut rows: rusqlite::Rows<'_>) -> Result<Vec<MessageRow>> {
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::map_row(row)?);
        }
        Ok(out)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<MessageRow> {
        const T: &str = "messages";
        let role: String = rh::get(row, 3, T, "role")?;
        let content: Option<String> = rh::get(row, 4, T, "content")?;
        let function_call: Option<String> = rh::get(row, 6, T, "function_call")?;
        let tool_result: Option<String> = rh::get(row, 7, T, "tool_result")?;
        let metadata: String = rh::get(row, 9, T, "metadata")?;
        let status_id: i64 = rh::get(row, 11, T, "status_id")?;

        Ok(MessageRow {
            chat_id: ChatId::from_raw(rh::get::<String>(row, 0, T, "chat_id")?),
            turn_id: rh::get(row, 1, T, "turn_id")?,
            message_id: rh::get(row, 2, T, "message_id")?,
            role: rh::parse_enum(&role, T, "role")?,
            content: rh::parse_json_opt(content.as_deref(), T, "content")?,
            tool_name: rh::get(row, 5, T, "tool_name")?,
            function_call: rh::parse_json_opt(function_call.as_deref(), T, "function_call")?,
            tool_result: rh::parse_json_opt(tool_result.as_deref(), T, "tool_result")?,
            provider_id: rh::get(row, 8, T, "provider_id")?,
            metadata: rh::parse_json(&metadata, T, "metadata")?,
            message_order: rh::get(row, 10, T, "message_order")?,
            status: MessageStatus::from_id(status_id).ok_or_else(|| StoreError::CorruptRow {
                table: T,
                column: "status_id",
                detail: format!("unknown status {status_id}"),
            })?,
            created_at: rh::get(row, 12, T, "created_at")?,
            updated_at: rh::get(row, 13, T, "updated_at")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
