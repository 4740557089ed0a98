//! # khp-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`KhpSettings::default()`])
//! 2. **User file** `~/.khplayer/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** `KHP_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    read_settings_file, settings_path,
};
pub use types::{KhpSettings, LoggingSettings, ObsSettings};
