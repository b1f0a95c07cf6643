//! `SQLite` connection pool with WAL mode and foreign keys enabled.
//!
//! Uses `r2d2` connection pooling with the `r2d2_sqlite` backend.
//! The [`PragmaCustomizer`] runs on each new connection.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 8).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 30000).
    pub busy_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u64,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// Create an in-memory connection pool (for tests and dry runs).
///
/// Every in-memory connection is its own database, so the pool holds exactly
/// one connection and never recycles it.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let pool = Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(SqliteConnectionManager::memory())?;
    Ok(pool)
}

/// Create a file-backed connection pool, creating parent directories.
pub fn new_file(path: &Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            crate::errors::StoreError::Internal(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let pool = Pool::builder()
        .max_size(config.pool_size.max(1))
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(SqliteConnectionManager::file(path))?;
    Ok(pool)
}

/// Verify pragmas are set correctly on a connection.
pub fn verify_pragmas(conn: &Connection) -> Result<PragmaState> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    Ok(PragmaState {
        journal_mode,
        foreign_keys_enabled: foreign_keys == 1,
    })
}

/// Pragma state for verification.
#[derive(Debug)]
pub struct PragmaState {
    /// Journal mode (`wal` for files, `memory` for in-memory databases).
    pub journal_mode: String,
    /// Whether foreign keys are enabled.
    pub foreign_keys_enabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_is_single_connection() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        assert_eq!(pool.max_size(), 1);
        let conn = pool.get().unwrap();
        let pragmas = verify_pragmas(&conn).unwrap();
        assert!(
            pragmas.journal_mode == "wal" || pragmas.journal_mode == "memory",
            "got: {}",
            pragmas.journal_mode
        );
        assert!(pragmas.foreign_keys_enabled);
    }

    #[test]
    fn in_memory_state_survives_checkout() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        pool.get().unwrap().execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let n: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn file_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scribe.db");
        let pool = new_file(&path, &ConnectionConfig { pool_size: 2, ..Default::default() }).unwrap();
        assert_eq!(pool.max_size(), 2);
        let conn = pool.get().unwrap();
        let pragmas = verify_pragmas(&conn).unwrap();
        assert_eq!(pragmas.journal_mode, "wal");
        assert!(path.exists());
    }
}
