//! Error types for the persistence pipeline.
//!
//! Mirrors the failure classes a turn can hit: the upstream stream failing,
//! a single write failing, a tool result with nothing to correlate to, and a
//! failed finalization.

use scribe_store::StoreError;
use thiserror::Error;

/// Errors raised while persisting a turn.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reading the upstream provider stream failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A storage write failed. Isolated to the task that issued it.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// A tool result arrived with no resolvable call.
    #[error("no tool call found for provider id {provider_id:?}")]
    CorrelationMiss {
        /// The correlation id carried by the result.
        provider_id: String,
    },

    /// Completing the turn failed.
    #[error("finalization error: {0}")]
    Finalization(String),

    /// A handler failed outside of storage (for example by panicking).
    #[error("handler error: {0}")]
    Handler(String),

    /// The queue worker exited before replying.
    #[error("processing queue closed")]
    QueueClosed,
}

/// Convenience type alias for pipeline results.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
