//! Repository implementations for `SQLite` database operations.
//!
//! Each repository is a stateless struct whose methods take a `&Connection`,
//! so the [`TranscriptDb`](crate::TranscriptDb) facade can compose several of
//! them inside one transaction.

pub mod chat;
pub mod message;
pub mod sequence;
pub mod token_usage;
pub mod turn;
