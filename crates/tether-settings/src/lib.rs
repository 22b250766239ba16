//! # tether-settings
//!
//! Configuration for the tether IPC layer, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **User file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! There is no global instance. The owning process loads settings once and
//! hands them to its `IpcContext`.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{ClientCarrier, ClientSettings, IpcSettings, LoggingSettings, TetherSettings};
