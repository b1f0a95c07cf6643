//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ScribeSettings::default()`]
//! 2. If `~/.scribe/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `SCRIBE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ScribeSettings;

/// The scribe home directory (`~/.scribe`).
pub fn scribe_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".scribe")
}

/// Resolve the path to the settings file (`~/.scribe/settings.json`).
pub fn settings_path() -> PathBuf {
    scribe_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ScribeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ScribeSettings> {
    let defaults = serde_json::to_value(ScribeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ScribeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SCRIBE_*` environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut ScribeSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_overrides_from(settings: &mut ScribeSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SCRIBE_DB_PATH").filter(|v| !v.is_empty()) {
        settings.database.path = PathBuf::from(v);
    }
    if let Some(raw) = lookup("SCRIBE_DB_POOL_SIZE") {
        match parse_u32_range(&raw, 1, 64) {
            Some(v) => settings.database.pool_size = v,
            None => warn!(key = "SCRIBE_DB_POOL_SIZE", value = %raw, "invalid pool size env var, ignoring"),
        }
    }
    if let Some(v) = lookup("SCRIBE_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.logging.level = v;
    }
    if let Some(raw) = lookup("SCRIBE_LOG_JSON") {
        match parse_bool(&raw) {
            Some(v) => settings.logging.json = v,
            None => warn!(key = "SCRIBE_LOG_JSON", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ───────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
