//! Error types for the transcript store.
//!
//! [`StoreError`] is returned by every repository and by the
//! [`TranscriptDb`](crate::TranscriptDb) facade.

use thiserror::Error;

/// Errors that can occur during transcript store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Requested chat was not found.
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    /// Requested turn was not found.
    #[error("turn not found: {chat_id}/{turn_id}")]
    TurnNotFound {
        /// Owning chat.
        chat_id: String,
        /// Turn number.
        turn_id: i64,
    },

    /// Requested message was not found.
    #[error("message not found: {chat_id}/{message_id}")]
    MessageNotFound {
        /// Owning chat.
        chat_id: String,
        /// Message number.
        message_id: i64,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// What was wrong with the value.
        detail: String,
    },

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Internal error (e.g. a panicked blocking task).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
