//! Turn repository: creation, error accumulation and finalization.
//!
//! A turn is finalized once: `complete` only touches rows whose
//! `completed_at` is still NULL, so a second finalization is a no-op.

use rusqlite::{Connection, OptionalExtension, params};
use scribe_core::{ChatId, TurnStatus};

use crate::errors::Result;
use crate::sqlite::row_helpers as rh;
use crate::sqlite::row_types::TurnRow;

const SELECT_TURN: &str = "SELECT chat_id, turn_id, status, created_at, completed_at, latency_ms, errors, needs_review
                           FROM turns";

/// Turn repository. Stateless; every method takes `&Connection`.
pub struct TurnRepo;

impl TurnRepo {
    /// Insert a new turn in `waiting` status.
    pub fn create(conn: &Connection, chat_id: &ChatId, turn_id: i64) -> Result<TurnRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO turns (chat_id, turn_id, status, created_at) VALUES (?1, ?2, 'waiting', ?3)",
            params![chat_id.as_str(), turn_id, now],
        )?;
        Ok(TurnRow {
            chat_id: chat_id.clone(),
            turn_id,
            status: TurnStatus::Waiting,
            created_at: now,
            completed_at: None,
            latency_ms: None,
            errors: Vec::new(),
            needs_review: false,
        })
    }

    /// Get a turn.
    pub fn get(conn: &Connection, chat_id: &ChatId, turn_id: i64) -> Result<Option<TurnRow>> {
        let mut stmt = conn.prepare(&format!("{SELECT_TURN} WHERE chat_id = ?1 AND turn_id = ?2"))?;
        let mut rows = stmt.query(params![chat_id.as_str(), turn_id])?;
        rows.next()?.map(Self::map_row).transpose()
    }

    /// List a chat's turns in order.
    pub fn list(conn: &Connection, chat_id: &ChatId) -> Result<Vec<TurnRow>> {
        let mut stmt = conn.prepare(&format!("{SELECT_TURN} WHERE chat_id = ?1 ORDER BY turn_id"))?;
        let mut rows = stmt.query(params![chat_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::map_row(row)?);
        }
        Ok(out)
    }

    /// Whether the turn exists and has not been finalized.
    pub fn is_open(conn: &Connection, chat_id: &ChatId, turn_id: i64) -> Result<bool> {
        let open: Option<i64> = conn
            .query_row(
                "SELECT completed_at IS NULL FROM turns WHERE chat_id = ?1 AND turn_id = ?2",
                params![chat_id.as_str(), turn_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(open == Some(1))
    }

    /// Append an error to the turn's error list, optionally flagging it for review.
    pub fn append_error(conn: &Connection, chat_id: &ChatId, turn_id: i64, error: &str, needs_review: bool) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE turns
             SET errors = json_insert(errors, '$[#]', ?3),
                 needs_review = MAX(needs_review, ?4)
             WHERE chat_id = ?1 AND turn_id = ?2",
            params![chat_id.as_str(), turn_id, error, needs_review],
        )?;
        Ok(changed > 0)
    }

    /// Finalize the turn with `status` and the measured latency.
    ///
    /// A turn already marked `error` keeps that status. Returns `false` if the
    /// turn was already finalized.
    pub fn complete(conn: &Connection, chat_id: &ChatId, turn_id: i64, status: TurnStatus, latency_ms: i64) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE turns
             SET status = CASE WHEN status = 'error' THEN 'error' ELSE ?3 END,
                 completed_at = ?4,
                 latency_ms = ?5
             WHERE chat_id = ?1 AND turn_id = ?2 AND completed_at IS NULL",
            params![chat_id.as_str(), turn_id, status.as_str(), now, latency_ms],
        )?;
        Ok(changed > 0)
    }

    /// Mark the turn errored and record `error`. A completed turn is left alone.
    pub fn fail(conn: &Connection, chat_id: &ChatId, turn_id: i64, error: &str) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE turns
             SET status = 'error',
                 completed_at = COALESCE(completed_at, ?4),
                 errors = json_insert(errors, '$[#]', ?3)
             WHERE chat_id = ?1 AND turn_id = ?2 AND status <> 'complete'",
            params![chat_id.as_str(), turn_id, error, now],
        )?;
        Ok(changed > 0)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> Result<TurnRow> {
        let status: String = rh::get(row, 2, "turns", "status")?;
        let errors: String = rh::get(row, 6, "turns", "errors")?;
        Ok(TurnRow {
            chat_id: ChatId::from_raw(rh::get::<String>(row, 0, "turns", "chat_id")?),
            turn_id: rh::get(row, 1, "turns", "turn_id")?,
            status: rh::parse_enum(&status, "turns", "status")?,
            created_at: rh::get(row, 3, "turns", "created_at")?,
            completed_at: rh::get(row, 4, "turns", "completed_at")?,
            latency_ms: rh::get(row, 5, "turns", "latency_ms")?,
            errors: rh::parse_json(&errors, "turns", "errors")?,
            needs_review: rh::get(row, 7, "turns", "needs_review")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
