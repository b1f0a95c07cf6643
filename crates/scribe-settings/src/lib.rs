//! # scribe-settings
//!
//! Configuration for the scribe transcript pipeline.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ScribeSettings::default()`]
//! 2. **User file**: `~/.scribe/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SCRIBE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{DatabaseSettings, LoggingSettings, PipelineSettings, ScribeSettings};
