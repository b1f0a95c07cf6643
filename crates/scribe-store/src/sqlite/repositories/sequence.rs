//! Sequence allocator: atomic, per-chat counters for turn and message numbers.
//!
//! A single `INSERT … ON CONFLICT DO UPDATE … RETURNING` statement bumps the
//! counter and reads it back, so two writers can never observe the same value
//! even without an enclosing transaction.

use rusqlite::{Connection, params};
use scribe_core::ChatId;

use crate::errors::{Result, StoreError};

/// What a counter numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceScope {
    /// Turn numbers within a chat.
    Turns,
    /// Message numbers within a chat.
    Messages,
}

impl SequenceScope {
    /// Table name recorded on the counter row.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Turns => "turns",
            Self::Messages => "messages",
        }
    }
}

/// Sequence repository. Stateless; every method takes `&Connection`.
pub struct SequenceRepo;

impl SequenceRepo {
    /// Allocate `count` contiguous ids in `scope` for `chat_id`, starting at 1
    /// for a fresh chat. `turn_id` is recorded on the counter for auditing.
    pub fn allocate(
        conn: &Connection,
        scope: SequenceScope,
        chat_id: &ChatId,
        turn_id: Option<i64>,
        count: u32,
    ) -> Result<Vec<i64>> {
        if count == 0 {
            return Err(StoreError::InvalidOperation("cannot allocate zero ids".into()));
        }
        let count = i64::from(count);
        let last: i64 = conn.query_row(
            "INSERT INTO scoped_sequences (table_name, chat_id, last_value, last_turn_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name, chat_id) DO UPDATE SET
               last_value = last_value + excluded.last_value,
               last_turn_id = COALESCE(excluded.last_turn_id, last_turn_id)
             RETURNING last_value",
            params![scope.as_str(), chat_id.as_str(), count, turn_id],
            |row| row.get(0),
        )?;
        Ok((last - count + 1..=last).collect())
    }

    /// Allocate a single id.
    pub fn next(conn: &Connection, scope: SequenceScope, chat_id: &ChatId, turn_id: Option<i64>) -> Result<i64> {
        let ids = Self::allocate(conn, scope, chat_id, turn_id, 1)?;
        ids.first()
            .copied()
            .ok_or_else(|| StoreError::Internal("allocator returned no ids".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::migrations::run_migrations;
    use assert_matches::assert_matches;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn starts_at_one_and_is_contiguous() {
        let conn = setup();
        let chat = ChatId::from_raw("c1");
        assert_eq!(SequenceRepo::allocate(&conn, SequenceScope::Messages, &chat, Some(1), 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(SequenceRepo::allocate(&conn, SequenceScope::Messages, &chat, Some(1), 2).unwrap(), vec![4, 5]);
        assert_eq!(SequenceRepo::next(&conn, SequenceScope::Messages, &chat, Some(2)).unwrap(), 6);
    }

    #[test]
    fn scopes_and_chats_are_independent() {
        let conn = setup();
        let a = ChatId::from_raw("a");
        let b = ChatId::from_raw("b");
        assert_eq!(SequenceRepo::next(&conn, SequenceScope::Turns, &a, None).unwrap(), 1);
        assert_eq!(SequenceRepo::next(&conn, SequenceScope::Turns, &a, None).unwrap(), 2);
        assert_eq!(SequenceRepo::next(&conn, SequenceScope::Turns, &b, None).unwrap(), 1);
        assert_eq!(SequenceRepo::next(&conn, SequenceScope::Messages, &a, Some(2)).unwrap(), 1);
    }

    #[test]
    fn records_last_turn() {
        let conn = setup();
        let chat = ChatId::from_raw("c1");
        let _ = SequenceRepo::next(&conn, SequenceScope::Messages, &chat, Some(4)).unwrap();
        let _ = SequenceRepo::next(&conn, SequenceScope::Messages, &chat, None).unwrap();
        let last_turn: Option<i64> = conn
            .query_row(
                "SELECT last_turn_id FROM scoped_sequences WHERE table_name = 'messages' AND chat_id = 'c1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_turn, Some(4));
    }

    #[test]
    fn zero_count_is_rejected() {
        let conn = setup();
        let result = SequenceRepo::allocate(&conn, SequenceScope::Turns, &ChatId::from_raw("c"), None, 0);
        assert_matches!(result, Err(StoreError::InvalidOperation(_)));
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA journal_mode = WAL;").unwrap();
            let _ = run_migrations(&conn).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let conn = Connection::open(&path).unwrap();
                    conn.busy_timeout(std::time::Duration::from_secs(10)).unwrap();
                    let chat = ChatId::from_raw("shared");
                    (0..10)
                        .map(|_| SequenceRepo::next(&conn, SequenceScope::Messages, &chat, None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=80).collect::<Vec<_>>());
    }
}
