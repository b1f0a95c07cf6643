//! Token usage repository: one row per turn.

use rusqlite::{Connection, OptionalExtension, params};
use scribe_core::{ChatId, Usage};

use crate::errors::Result;
use crate::sqlite::row_types::TokenUsageRow;

/// Token usage repository. Stateless; every method takes `&Connection`.
pub struct TokenUsageRepo;

impl TokenUsageRepo {
    /// Record usage for a turn. A second report for the same turn replaces
    /// the first.
    pub fn upsert(conn: &Connection, chat_id: &ChatId, turn_id: i64, usage: &Usage) -> Result<TokenUsageRow> {
        let now = chrono::Utc::now().to_rfc3339();
        let row = TokenUsageRow {
            turn_id,
            input_tokens: saturating_i64(usage.input_tokens),
            output_tokens: saturating_i64(usage.output_tokens),
            total_tokens: saturating_i64(usage.total_tokens),
        };
        let _ = conn.execute(
            "INSERT INTO token_usage (chat_id, turn_id, input_tokens, output_tokens, total_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(chat_id, turn_id) DO UPDATE SET
               input_tokens = excluded.input_tokens,
               output_tokens = excluded.output_tokens,
               total_tokens = excluded.total_tokens",
            params![
                chat_id.as_str(),
                turn_id,
                row.input_tokens,
                row.output_tokens,
                row.total_tokens,
                now
            ],
        )?;
        Ok(row)
    }

    /// Usage recorded for a turn.
    pub fn get(conn: &Connection, chat_id: &ChatId, turn_id: i64) -> Result<Option<TokenUsageRow>> {
        let row = conn
            .query_row(
                "SELECT turn_id, input_tokens, output_tokens, total_tokens
                 FROM token_usage WHERE chat_id = ?1 AND turn_id = ?2",
                params![chat_id.as_str(), turn_id],
                |row| {
                    Ok(TokenUsageRow {
                        turn_id: row.get(0)?,
                        input_tokens: row.get(1)?,
                        output_tokens: row.get(2)?,
                        total_tokens: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
