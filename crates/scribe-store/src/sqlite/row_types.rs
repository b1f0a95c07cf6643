//! Decoded rows of the transcript tables.

use scribe_core::{ChatId, MessageContent, MessageStatus, OwnerId, Role, TurnStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key holding the turn that last modified a tool row.
pub const MODIFIED_TURN_KEY: &str = "modifiedTurnId";

/// Row from the `chats` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRow {
    /// Chat ID.
    pub id: ChatId,
    /// Owning user or service.
    pub owner: OwnerId,
    /// Title, `None` until derived.
    pub title: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

/// Row from the `turns` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRow {
    /// Owning chat.
    pub chat_id: ChatId,
    /// Turn number, unique per chat.
    pub turn_id: i64,
    /// Lifecycle status.
    pub status: TurnStatus,
    /// Creation timestamp.
    pub created_at: String,
    /// Finalization timestamp.
    pub completed_at: Option<String>,
    /// Wall time from turn start to finalization.
    pub latency_ms: Option<i64>,
    /// Errors accumulated while the turn streamed.
    pub errors: Vec<String>,
    /// Set when a tool reported a failure during the turn.
    pub needs_review: bool,
}

/// Row from the `messages` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Owning chat.
    pub chat_id: ChatId,
    /// Turn the row was created in.
    pub turn_id: i64,
    /// Message number, unique per chat.
    pub message_id: i64,
    /// Author role.
    pub role: Role,
    /// Body; tool rows usually have none.
    pub content: Option<MessageContent>,
    /// Tool name for tool rows.
    pub tool_name: Option<String>,
    /// Parsed tool arguments.
    pub function_call: Option<Value>,
    /// Tool output.
    pub tool_result: Option<Value>,
    /// Correlation id for tool rows.
    pub provider_id: Option<String>,
    /// Free-form metadata object.
    pub metadata: Value,
    /// Position within the turn.
    pub message_order: i64,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl MessageRow {
    /// The turn that last modified this row, from `metadata.modifiedTurnId`.
    pub fn modified_turn_id(&self) -> Option<i64> {
        self.metadata.get(MODIFIED_TURN_KEY).and_then(Value::as_i64)
    }
}

/// Row from the `token_usage` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageRow {
    /// Turn number.
    pub turn_id: i64,
    /// Prompt tokens.
    pub input_tokens: i64,
    /// Completion tokens.
    pub output_tokens: i64,
    /// Total tokens.
    pub total_tokens: i64,
}
