//! # scribe-core
//!
//! Shared vocabulary for the scribe transcript pipeline.
//!
//! - **Branded IDs**: [`ChatId`], [`OwnerId`] as newtypes for type safety
//! - **Stream chunks**: [`StreamChunk`], the discriminated event a provider stream emits
//! - **Content parts**: [`ContentPart`] and [`MessageContent`], the persisted message body
//! - **Statuses**: [`Role`], [`MessageStatus`], [`TurnStatus`]
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` bootstrap

#![deny(unsafe_code)]

pub mod chunks;
pub mod content;
pub mod ids;
pub mod logging;
pub mod messages;

pub use chunks::{StreamChunk, ToolOutput, Usage};
pub use content::{ContentPart, MessageContent};
pub use ids::{ChatId, OwnerId};
pub use messages::{MessageStatus, Role, TurnStatus};
