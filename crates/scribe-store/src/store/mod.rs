//! High-level `TranscriptDb` API.
//!
//! The [`TranscriptDb`] composes the repositories into transactional writes.
//! Callers never see partial state: a turn is created together with its
//! prompt, and a tool upsert reads and writes under one write lock.

mod transcript_db;

pub use transcript_db::*;
