//! # huddle-settings
//!
//! Layered configuration for the huddle gateway.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults** - [`HuddleSettings::default()`]
//! 2. **Settings file** - `~/.huddle/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables** - `HUDDLE_*` overrides (highest priority)
//!
//! The binary applies its CLI flags on top of the loaded value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = HuddleSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn defaults_match_legacy_ports() {
        let settings = HuddleSettings::default();
        assert_eq!(settings.server.port, 8001);
        assert_eq!(settings.backend.url, "ws://127.0.0.1:8765");
        assert!(!settings.rooms.reap_empty);
    }
}
