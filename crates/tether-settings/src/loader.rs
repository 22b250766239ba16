//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ClientCarrier, TetherSettings};

/// Resolve the default settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged result
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
///
/// Empty values are ignored. Values that fail to parse or fall outside their
/// range are ignored with a warning.
pub fn apply_overrides_from<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Hub host ────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_WATCH").and_then(|v| checked("TETHER_WATCH", &v, parse_bool)) {
        settings.ipc.watch = v;
    }
    if let Some(v) = read("TETHER_HOST") {
        settings.ipc.host = v;
    }
    if let Some(v) = read("TETHER_PORT")
        .and_then(|v| checked("TETHER_PORT", &v, |s| parse_u16_range(s, 0, 65535)))
    {
        settings.ipc.port = v;
    }
    if let Some(v) = read("TETHER_PROTOCOL") {
        settings.ipc.protocol = v;
    }
    if let Some(v) = read("TETHER_KEEPALIVE_MS")
        .and_then(|v| checked("TETHER_KEEPALIVE_MS", &v, |s| parse_u64_range(s, 100, 3_600_000)))
    {
        settings.ipc.keepalive_ms = v;
    }
    if let Some(v) = read("TETHER_IPC_ADDR") {
        settings.ipc.attach_address = Some(v);
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_RETRY_AFTER_MS")
        .and_then(|v| checked("TETHER_RETRY_AFTER_MS", &v, |s| parse_u64_range(s, 0, 600_000)))
    {
        settings.client.retry_after_ms = v;
    }
    if let Some(v) =
        read("TETHER_CARRIER").and_then(|v| checked("TETHER_CARRIER", &v, ClientCarrier::parse))
    {
        settings.client.carrier = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

fn checked<T>(key: &str, val: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(val);
    if result.is_none() {
        warn!(key, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
