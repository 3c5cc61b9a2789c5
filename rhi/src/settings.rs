//! Runtime configuration.
//!
//! A small enumerated set of keys, sourced from `GRANITE_*` environment
//! variables (`GRANITE_PREFERRED_BACKEND=legacy`,
//! `GRANITE_TEXTURE_POOL_SIZE_BYTES=134217728`, ...). Anything unset falls
//! back to the defaults below.

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredBackend {
    /// Pick the explicit backend when available, otherwise immediate.
    Auto,
    /// The explicit-submission backend.
    Modern,
    /// The immediate-mode backend.
    Legacy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub preferred_backend: PreferredBackend,
    pub enable_validation: bool,
    pub enable_debug_markers: bool,
    pub texture_pool_size_bytes: u64,
    pub frame_arena_bytes: u64,
    pub huge_pages_for_textures: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            preferred_backend: PreferredBackend::Auto,
            enable_validation: cfg!(debug_assertions),
            enable_debug_markers: false,
            texture_pool_size_bytes: 256 * 1024 * 1024,
            frame_arena_bytes: 8 * 1024 * 1024,
            huge_pages_for_textures: true,
        }
    }
}

static ENV_SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

impl Settings {
    /// Reads the `GRANITE_*` environment, falling back to defaults for
    /// anything missing or malformed.
    pub fn from_env() -> Settings {
        let source = config::Environment::with_prefix("GRANITE").try_parsing(true);
        match config::Config::builder().add_source(source).build() {
            Ok(cfg) => cfg.try_deserialize().unwrap_or_else(|err| {
                log::warn!(target: "gfx", "malformed GRANITE_* configuration: {err}");
                Settings::default()
            }),
            Err(err) => {
                log::warn!(target: "gfx", "failed to read configuration: {err}");
                Settings::default()
            }
        }
    }

    /// Environment settings, read once per process.
    pub fn get() -> &'static Settings {
        &ENV_SETTINGS
    }

    /// Resolves the preference to a concrete backend.
    pub fn resolve_backend(&self) -> Backend {
        match self.preferred_backend {
            PreferredBackend::Auto | PreferredBackend::Modern => Backend::Explicit,
            PreferredBackend::Legacy => Backend::Immediate,
        }
    }

    /// Allocator construction parameters carrying the configured arena and
    /// huge-page knobs.
    pub fn memory_config(&self) -> granite_memory::MemoryConfig {
        granite_memory::MemoryConfig {
            frame_arena_bytes: self.frame_arena_bytes,
            huge_pages_for_textures: self.huge_pages_for_textures,
            ..granite_memory::MemoryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.preferred_backend, PreferredBackend::Auto);
        assert_eq!(s.resolve_backend(), Backend::Explicit);
        assert!(s.texture_pool_size_bytes >= 64 * 1024 * 1024);
    }

    #[test]
    fn legacy_preference_resolves_to_immediate() {
        let s = Settings {
            preferred_backend: PreferredBackend::Legacy,
            ..Settings::default()
        };
        assert_eq!(s.resolve_backend(), Backend::Immediate);
    }
}
