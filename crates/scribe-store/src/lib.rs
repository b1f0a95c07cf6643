//! # scribe-store
//!
//! `SQLite` transcript storage for the scribe pipeline.
//!
//! - **Transcript store**: [`TranscriptDb`] opens turns, allocates message
//!   numbers, upserts tool rows and finalizes turns, each in one transaction
//! - **Merge law**: [`merge_tool_fields`] decides what a repeated tool write
//!   may change
//! - **History import**: [`plan_import`] dedupes a resent conversation
//!   against persisted rows
//! - **`SQLite` backend**: `rusqlite` over an `r2d2` pool with the repository
//!   pattern (chat, turn, message, sequence, token usage)
//! - **Migrations**: version-tracked schema

#![deny(unsafe_code)]

pub mod errors;
pub mod history;
pub mod merge;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use history::{ImportAction, ImportMessage, ImportReport, normalize_content, plan_import};
pub use merge::{ToolPatch, ToolState, merge_tool_fields};
pub use sqlite::connection::ConnectionConfig;
pub use sqlite::repositories::sequence::SequenceScope;
pub use sqlite::row_types::{ChatRow, MODIFIED_TURN_KEY, MessageRow, TokenUsageRow, TurnRow};
pub use store::{AppendMessage, BeginTurn, ToolUpsert, ToolWrite, TranscriptDb, TurnStart, UpsertOutcome};
