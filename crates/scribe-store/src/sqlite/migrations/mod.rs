//! Schema migration runner.
//!
//! Migrations are embedded at compile time via [`include_str!`] and executed
//! in version order, each inside its own transaction. The `schema_version`
//! table records what has been applied, so running the migrator twice is a
//! no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::{Result, StoreError};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Transcript schema: chats, turns, messages, token usage, scoped sequences",
    sql: include_str!("v001_schema.sql"),
}];

/// Run all pending migrations. Returns how many were applied.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    ensure_version_table(conn)?;
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied, skipping");
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        apply_migration(conn, migration)?;
        applied += 1;
    }

    Ok(applied)
}

/// Return the highest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| StoreError::Migration {
            message: format!("failed to read schema_version: {e}"),
        })
}

/// Return the latest migration version defined in code.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| StoreError::Migration {
        message: format!("failed to create schema_version table: {e}"),
    })
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction().map_err(|e| StoreError::Migration {
        message: format!("failed to begin transaction for v{}: {e}", migration.version),
    })?;

    tx.execute_batch(migration.sql).map_err(|e| StoreError::Migration {
        message: format!("migration v{} ({}) failed: {e}", migration.version, migration.description),
    })?;

    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, datetime('now'), ?2)",
            rusqlite::params![migration.version, migration.description],
        )
        .map_err(|e| StoreError::Migration {
            message: format!("failed to record v{} in schema_version: {e}", migration.version),
        })?;

    tx.commit().map_err(|e| StoreError::Migration {
        message: format!("failed to commit v{}: {e}", migration.version),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, latest_version());
        for table in ["chats", "turns", "messages", "token_usage", "scoped_sequences"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn rerun_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), 0);
        assert_eq!(current_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn tool_provider_index_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO chats (id, owner, created_at) VALUES ('c', 'o', 'now');
             INSERT INTO turns (chat_id, turn_id, created_at) VALUES ('c', 1, 'now');
             INSERT INTO messages (chat_id, turn_id, message_id, role, provider_id, message_order, created_at, updated_at)
               VALUES ('c', 1, 1, 'tool', 't1', 1, 'now', 'now');",
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO messages (chat_id, turn_id, message_id, role, provider_id, message_order, created_at, updated_at)
             VALUES ('c', 1, 2, 'tool', 't1', 2, 'now', 'now')",
            [],
        );
        assert!(dup.is_err());

        // Non-tool rows may share a provider id.
        let _ = conn
            .execute(
                "INSERT INTO messages (chat_id, turn_id, message_id, role, provider_id, message_order, created_at, updated_at)
                 VALUES ('c', 1, 3, 'assistant', 't1', 3, 'now', 'now')",
                [],
            )
            .unwrap();
    }
}
