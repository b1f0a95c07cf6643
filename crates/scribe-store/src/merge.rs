//! Merge law for tool rows.
//!
//! A tool row is keyed by its correlation id and may be touched many times:
//! once for the call, once for the result, and again whenever a retried turn
//! echoes the same call. [`merge_tool_fields`] decides what each such write
//! is allowed to change:
//!
//! - a field is filled when the row has no value for it;
//! - a differing value replaces the stored one only when the write comes from
//!   a turn newer than the row's `modifiedTurnId` (absent counts as older);
//! - status only moves forward, pending to complete or error;
//! - a write that changes nothing is reported as such and must not be
//!   persisted, which makes replays free.

use scribe_core::MessageStatus;
use serde_json::Value;

use crate::sqlite::row_types::MessageRow;

/// The mergeable state of a tool row.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolState {
    /// Tool name.
    pub tool_name: Option<String>,
    /// Parsed arguments.
    pub function_call: Option<Value>,
    /// Tool output.
    pub tool_result: Option<Value>,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Turn of the last effective write.
    pub modified_turn_id: Option<i64>,
}

impl From<&MessageRow> for ToolState {
    fn from(row: &MessageRow) -> Self {
        Self {
            tool_name: row.tool_name.clone(),
            function_call: row.function_call.clone(),
            tool_result: row.tool_result.clone(),
            status: row.status,
            modified_turn_id: row.modified_turn_id(),
        }
    }
}

/// An incoming write to a tool row.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolPatch {
    /// Tool name, when known.
    pub tool_name: Option<String>,
    /// Parsed arguments, for tool calls.
    pub function_call: Option<Value>,
    /// Tool output, for tool results.
    pub tool_result: Option<Value>,
    /// Status the writer wants the row to have.
    pub status: MessageStatus,
}

impl ToolPatch {
    /// A tool call: arguments known, result pending.
    pub fn call(tool_name: impl Into<String>, function_call: Value) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            function_call: Some(function_call),
            tool_result: None,
            status: MessageStatus::Pending,
        }
    }

    /// A tool result with its final status.
    pub fn result(tool_name: impl Into<String>, tool_result: Value, status: MessageStatus) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            function_call: None,
            tool_result: Some(tool_result),
            status,
        }
    }

    /// The state of a row created fresh from this patch in `turn_id`.
    pub fn into_state(self, turn_id: i64) -> ToolState {
        ToolState {
            tool_name: self.tool_name,
            function_call: self.function_call,
            tool_result: self.tool_result,
            status: self.status,
            modified_turn_id: Some(turn_id),
        }
    }
}

/// Apply `patch` from `incoming_turn` to `existing`.
///
/// Returns the new state stamped with `incoming_turn`, or `None` when the
/// patch changes nothing.
pub fn merge_tool_fields(existing: &ToolState, patch: &ToolPatch, incoming_turn: i64) -> Option<ToolState> {
    let is_newer = existing.modified_turn_id.is_none_or(|m| incoming_turn > m);
    let mut next = existing.clone();
    let mut changed = false;

    changed |= merge_field(&mut next.function_call, patch.function_call.as_ref(), is_newer);
    changed |= merge_field(&mut next.tool_result, patch.tool_result.as_ref(), is_newer);

    if next.tool_name.is_none() && patch.tool_name.is_some() {
        next.tool_name.clone_from(&patch.tool_name);
        changed = true;
    }

    let status = existing.status.advance(patch.status);
    if status != existing.status {
        next.status = status;
        changed = true;
    }

    changed.then(|| {
        next.modified_turn_id = Some(incoming_turn);
        next
    })
}

fn merge_field(slot: &mut Option<Value>, incoming: Option<&Value>, is_newer: bool) -> bool {
    let Some(incoming) = incoming else {
        return false;
    };
    match slot {
        None => {
            *slot = Some(incoming.clone());
            true
        }
        Some(current) if is_newer && current != incoming => {
            *current = incoming.clone();
            true
        }
        Some(_) => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(function_call: Value, modified: i64) -> ToolState {
        ToolState {
            tool_name: Some("lookup".into()),
            function_call: Some(function_call),
            tool_result: None,
            status: MessageStatus::Pending,
            modified_turn_id: Some(modified),
        }
    }

    #[test]
    fn same_turn_does_not_overwrite() {
        let existing = row(json!("A"), 5);
        let patch = ToolPatch::call("lookup", json!("B"));
        assert_eq!(merge_tool_fields(&existing, &patch, 5), None);
    }

    #[test]
    fn older_turn_does_not_overwrite() {
        let existing = row(json!("A"), 5);
        assert_eq!(merge_tool_fields(&existing, &ToolPatch::call("lookup", json!("B")), 4), None);
    }

    #[test]
    fn newer_turn_overwrites_and_stamps() {
        let existing = row(json!("A"), 5);
        let merged = merge_tool_fields(&existing, &ToolPatch::call("lookup", json!("B")), 6).unwrap();
        assert_eq!(merged.function_call, Some(json!("B")));
        assert_eq!(merged.modified_turn_id, Some(6));
    }

    #[test]
    fn missing_field_is_filled_regardless_of_turn() {
        let existing = row(json!({"q": 1}), 5);
        let patch = ToolPatch::result("lookup", json!("42"), MessageStatus::Complete);
        let merged = merge_tool_fields(&existing, &patch, 3).unwrap();
        assert_eq!(merged.tool_result, Some(json!("42")));
        assert_eq!(merged.function_call, Some(json!({"q": 1})));
        assert_eq!(merged.status, MessageStatus::Complete);
        assert_eq!(merged.modified_turn_id, Some(3));
    }

    #[test]
    fn absent_stamp_counts_as_older() {
        let mut existing = row(json!("A"), 0);
        existing.modified_turn_id = None;
        let merged = merge_tool_fields(&existing, &ToolPatch::call("lookup", json!("B")), 1).unwrap();
        assert_eq!(merged.function_call, Some(json!("B")));
    }

    #[test]
    fn status_never_regresses() {
        let mut existing = row(json!("A"), 5);
        existing.status = MessageStatus::Complete;
        existing.tool_result = Some(json!("done"));
        // A replayed call from a newer turn with identical arguments changes nothing.
        assert_eq!(merge_tool_fields(&existing, &ToolPatch::call("lookup", json!("A")), 9), None);
    }

    #[test]
    fn tool_name_is_filled_when_missing() {
        let mut existing = row(json!("A"), 5);
        existing.tool_name = None;
        let merged = merge_tool_fields(&existing, &ToolPatch::call("lookup", json!("A")), 5).unwrap();
        assert_eq!(merged.tool_name.as_deref(), Some("lookup"));
    }

    fn arb_value() -> impl Strategy<Value = Option<Value>> {
        prop_oneof![
            Just(None),
            any::<i64>().prop_map(|n| Some(json!(n))),
            "[a-z]{0,6}".prop_map(|s| Some(json!(s))),
        ]
    }

    fn arb_status() -> impl Strategy<Value = MessageStatus> {
        prop_oneof![
            Just(MessageStatus::Pending),
            Just(MessageStatus::Complete),
            Just(MessageStatus::Error),
        ]
    }

    prop_compose! {
        fn arb_state()(
            function_call in arb_value(),
            tool_result in arb_value(),
            status in arb_status(),
            modified in proptest::option::of(0i64..10),
        ) -> ToolState {
            ToolState { tool_name: None, function_call, tool_result, status, modified_turn_id: modified }
        }
    }

    prop_compose! {
        fn arb_patch()(
            function_call in arb_value(),
            tool_result in arb_value(),
            status in arb_status(),
        ) -> ToolPatch {
            ToolPatch { tool_name: Some("t".into()), function_call, tool_result, status }
        }
    }

    proptest! {
        #[test]
        fn replaying_a_patch_is_a_noop(state in arb_state(), patch in arb_patch(), turn in 0i64..10) {
            let once = merge_tool_fields(&state, &patch, turn).unwrap_or(state);
            prop_assert_eq!(merge_tool_fields(&once, &patch, turn), None);
        }

        #[test]
        fn terminal_status_is_sticky(state in arb_state(), patch in arb_patch(), turn in 0i64..10) {
            if let Some(merged) = merge_tool_fields(&state, &patch, turn) {
                if state.status.is_terminal() {
                    prop_assert_eq!(merged.status, state.status);
                }
                prop_assert_eq!(merged.modified_turn_id, Some(turn));
            }
        }
    }
}
