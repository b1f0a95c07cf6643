//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a partial JSON file only needs the keys it overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "database": { "path": "/var/lib/scribe/scribe.db", "poolSize": 4 },
///   "pipeline": { "titleMaxWords": 8 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScribeSettings {
    /// Storage location and connection pool.
    pub database: DatabaseSettings,
    /// Transcript pipeline behavior.
    pub pipeline: PipelineSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ScribeSettings {
    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(SettingsError::InvalidValue("database.poolSize must be at least 1".into()));
        }
        if self.pipeline.title_max_words == 0 || self.pipeline.title_max_chars == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline title limits must be at least 1".into(),
            ));
        }
        if self.pipeline.first_message_order < 1 {
            return Err(SettingsError::InvalidValue(
                "pipeline.firstMessageOrder must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// `SQLite` database settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file path.
    pub path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: crate::loader::scribe_home().join("database").join("scribe.db"),
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

/// Pipeline behavior settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Words kept when deriving a chat title from the first response.
    pub title_max_words: usize,
    /// Character cap on a derived chat title.
    pub title_max_chars: usize,
    /// Message order given to the user prompt row; the response starts after it.
    pub first_message_order: i64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            title_max_words: 6,
            title_max_chars: 80,
            first_message_order: 1,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
