//! Roles and lifecycle statuses for persisted rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user.
    User,
    /// The model.
    Assistant,
    /// A tool invocation and its result.
    Tool,
    /// System instructions.
    System,
}

impl Role {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Lifecycle of a message row. Stored as `status_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Reserved, still being written.
    Pending,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Error,
}

impl MessageStatus {
    /// Numeric id stored in the `status_id` column.
    pub fn as_id(self) -> i64 {
        match self {
            Self::Pending => 1,
            Self::Complete => 2,
            Self::Error => 3,
        }
    }

    /// Inverse of [`MessageStatus::as_id`].
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Pending),
            2 => Some(Self::Complete),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the status is final. Terminal statuses never regress.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Apply the forward-only rule: a pending row may become terminal, a
    /// terminal row keeps its status.
    #[must_use]
    pub fn advance(self, incoming: Self) -> Self {
        if self.is_terminal() { self } else { incoming }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Error => "error",
        })
    }
}

/// Lifecycle of a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Response still streaming.
    Waiting,
    /// Finalized successfully.
    Complete,
    /// Finalized with errors.
    Error,
}

impl TurnStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown turn status: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
