//! `SQLite` backend for the transcript store.
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode and foreign keys on every
//!   connection.
//! - **[`migrations`]**: version-tracked schema, embedded at compile time.
//! - **[`row_types`]**: decoded rows.
//! - **[`repositories`]**: stateless repositories over `&Connection`.

pub mod connection;
pub mod migrations;
pub mod repositories;
pub(crate) mod row_helpers;
pub mod row_types;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, PragmaState, new_file, new_in_memory, verify_pragmas};
pub use migrations::{current_version, latest_version, run_migrations};
