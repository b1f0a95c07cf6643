//! Re-import planning for caller-supplied message histories.
//!
//! Clients resend the whole conversation with every request, so an import
//! overlaps rows already persisted. Plain messages are matched on a
//! `(role, normalized text)` signature; tool-bearing messages are matched on
//! their correlation id and left to the tool merge law, which lets the
//! newer turn win.

use std::collections::HashSet;

use scribe_core::{ContentPart, MessageContent, MessageStatus, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sqlite::row_types::MessageRow;

/// One message of an imported history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMessage {
    /// Author role.
    pub role: Role,
    /// Body.
    #[serde(default)]
    pub content: MessageContent,
    /// Tool name for tool-bearing entries.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Correlation id for tool-bearing entries.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Tool arguments.
    #[serde(default)]
    pub function_call: Option<Value>,
    /// Tool output.
    #[serde(default)]
    pub tool_result: Option<Value>,
}

impl ImportMessage {
    /// A plain message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_name: None,
            provider_id: None,
            function_call: None,
            tool_result: None,
        }
    }

    /// Whether the entry is matched by correlation id rather than content.
    pub fn is_tool_bearing(&self) -> bool {
        self.provider_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Status a fresh tool row gets: complete once the result is known.
    pub fn tool_status(&self) -> MessageStatus {
        if self.tool_result.is_some() {
            MessageStatus::Complete
        } else {
            MessageStatus::Pending
        }
    }
}

/// What to do with one imported entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportAction {
    /// New content; insert a row.
    Insert,
    /// Already persisted; leave it.
    Skip,
    /// Tool-bearing; route through the tool upsert.
    UpsertTool,
}

/// Counts from an import.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Rows inserted.
    pub inserted: usize,
    /// Existing tool rows updated.
    pub merged: usize,
    /// Entries that matched existing rows without changes.
    pub skipped: usize,
}

/// Canonical text used to compare message bodies: visible text with
/// whitespace collapsed, or the JSON body when there is no visible text.
pub fn normalize_content(content: &MessageContent) -> String {
    let text = match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join(" "),
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() && !content.is_empty() {
        serde_json::to_string(content).unwrap_or_default()
    } else {
        collapsed
    }
}

/// Decide per incoming entry whether to insert, skip, or upsert.
pub fn plan_import(existing: &[MessageRow], incoming: &[ImportMessage]) -> Vec<ImportAction> {
    let mut seen: HashSet<(Role, String)> = existing
        .iter()
        .filter(|row| row.role != Role::Tool)
        .map(|row| {
            let body = row.content.as_ref().map(normalize_content).unwrap_or_default();
            (row.role, body)
        })
        .collect();

    incoming
        .iter()
        .map(|msg| {
            if msg.is_tool_bearing() {
                return ImportAction::UpsertTool;
            }
            if seen.insert((msg.role, normalize_content(&msg.content))) {
                ImportAction::Insert
            } else {
                ImportAction::Skip
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
