use serde::de::DeserializeOwned;

use crate::errors::StoreError;

/// Get a column value from a row, returning `CorruptRow` on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Decode a JSON text column.
pub fn parse_json<T: DeserializeOwned>(raw: &str, table: &'static str, column: &'static str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Decode an optional JSON text column.
pub fn parse_json_opt<T: DeserializeOwned>(
    raw: Option<&str>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| parse_json(s, table, column)).transpose()
}

/// Parse a string into an enum, returning `CorruptRow` on failure.
pub fn parse_enum<T: std::str::FromStr>(raw: &str, table: &'static str, column: &'static str) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Encode an optional JSON value for a text column.
pub fn to_json_opt<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, StoreError> {
    value.map(serde_json::to_string).transpose().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use scribe_core::Role;

    #[test]
    fn parse_enum_success() {
        let role: Role = parse_enum("assistant", "messages", "role").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Role, _> = parse_enum("robot", "messages", "role");
        assert_matches!(result, Err(StoreError::CorruptRow { column: "role", .. }));
    }

    #[test]
    fn parse_json_opt_passes_none_through() {
        let value: Option<serde_json::Value> = parse_json_opt(None, "messages", "tool_result").unwrap();
        assert!(value.is_none());
        let bad: Result<Option<serde_json::Value>, _> = parse_json_opt(Some("{"), "messages", "tool_result");
        assert_matches!(bad, Err(StoreError::CorruptRow { .. }));
    }
}
