//! Chat repository.

use rusqlite::{Connection, OptionalExtension, params};
use scribe_core::{ChatId, OwnerId};

use crate::errors::Result;
use crate::sqlite::row_helpers as rh;
use crate::sqlite::row_types::ChatRow;

/// Chat repository. Stateless; every method takes `&Connection`.
pub struct ChatRepo;

impl ChatRepo {
    /// Return the chat, creating it with no title if it does not exist.
    ///
    /// An existing chat keeps its original owner.
    pub fn get_or_create(conn: &Connection, chat_id: &ChatId, owner: &OwnerId) -> Result<ChatRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO chats (id, owner, title, created_at) VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![chat_id.as_str(), owner.as_str(), now],
        )?;
        match Self::get(conn, chat_id)? {
            Some(chat) => Ok(chat),
            None => Err(crate::errors::StoreError::ChatNotFound(chat_id.to_string())),
        }
    }

    /// Get a chat by ID.
    pub fn get(conn: &Connection, chat_id: &ChatId) -> Result<Option<ChatRow>> {
        let mut stmt = conn.prepare("SELECT id, owner, title, created_at FROM chats WHERE id = ?1")?;
        let mut rows = stmt.query(params![chat_id.as_str()])?;
        rows.next()?.map(Self::map_row).transpose()
    }

    /// Set the title only if none has been set. Returns whether it was written.
    pub fn set_title_if_absent(conn: &Connection, chat_id: &ChatId, title: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE chats SET title = ?2 WHERE id = ?1 AND (title IS NULL OR title = '')",
            params![chat_id.as_str(), title],
        )?;
        Ok(changed > 0)
    }

    /// Whether the chat exists.
    pub fn exists(conn: &Connection, chat_id: &ChatId) -> Result<bool> {
        let found = conn
            .query_row("SELECT 1 FROM chats WHERE id = ?1", params![chat_id.as_str()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<ChatRow> {
        Ok(ChatRow {
            id: ChatId::from_raw(rh::get::<String>(row, 0, "chats", "id")?),
            owner: OwnerId::from_raw(rh::get::<String>(row, 1, "chats", "owner")?),
            title: rh::get(row, 2, "chats", "title")?,
            created_at: rh::get(row, 3, "chats", "created_at")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
