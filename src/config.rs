//! Configuration for the watch service and the `watchmux` binary.
//!
//! Layered configuration:
//! - Default values
//! - TOML configuration file (`.watchmux/settings.toml`, searched upwards
//!   from the current directory)
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `WATCHMUX_` and use double
//! underscores to separate nested levels:
//! - `WATCHMUX_WATCHER__DISPATCH_THREADS=8` sets `watcher.dispatch_threads`
//! - `WATCHMUX_WATCHER__SUBTREE_WATCHING=false` sets `watcher.subtree_watching`
//! - `WATCHMUX_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".watchmux";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "WATCHMUX_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watch service settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Share one recursive watch per root-level directory when the platform
    /// supports it
    #[serde(default = "default_true")]
    pub subtree_watching: bool,

    /// Threads delivering listener callbacks
    #[serde(default = "default_dispatch_threads")]
    pub dispatch_threads: usize,

    /// Events buffered per native handle before an overflow is reported
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// How long the token reaper thread idles before exiting
    #[serde(default = "default_reaper_idle_timeout_ms")]
    pub reaper_idle_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `watchmux::registrar = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_dispatch_threads() -> usize {
    num_cpus::get().clamp(1, 8)
}
fn default_event_queue_capacity() -> usize {
    512
}
fn default_reaper_idle_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            subtree_watching: true,
            dispatch_threads: default_dispatch_threads(),
            event_queue_capacity: default_event_queue_capacity(),
            reaper_idle_timeout_ms: default_reaper_idle_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| Path::new(CONFIG_DIR).join(CONFIG_FILE));

        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // `__` separates levels, single `_` stays part of the field name
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Load configuration from a specific file (defaults + file only)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.watchmux/settings.toml` in the current directory or an ancestor
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in `.watchmux/` under the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = Path::new(CONFIG_DIR).join(CONFIG_FILE);
        Self::write_default(&config_path, force)?;
        Ok(config_path)
    }

    fn write_default(config_path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }
        Settings::default().save(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert!(settings.watcher.subtree_watching);
        assert!(settings.watcher.dispatch_threads > 0);
        assert_eq!(settings.watcher.event_queue_capacity, 512);
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[watcher]
subtree_watching = false
dispatch_threads = 3
reaper_idle_timeout_ms = 500

[logging]
default = "info"

[logging.modules]
"watchmux::registrar" = "trace"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert!(!settings.watcher.subtree_watching);
        assert_eq!(settings.watcher.dispatch_threads, 3);
        assert_eq!(settings.watcher.reaper_idle_timeout_ms, 500);
        // Unspecified values keep their defaults
        assert_eq!(settings.watcher.event_queue_capacity, 512);
        assert_eq!(settings.logging.default, "info");
        assert_eq!(settings.logging.modules["watchmux::registrar"], "trace");
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.watcher.dispatch_threads = 2;
        settings.watcher.event_queue_capacity = 64;

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.watcher.dispatch_threads, 2);
        assert_eq!(loaded.watcher.event_queue_capacity, 64);
    }

    #[test]
    fn test_write_default_respects_force() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_DIR).join(CONFIG_FILE);

        Settings::write_default(&config_path, false).unwrap();
        assert!(config_path.exists());
        assert!(Settings::write_default(&config_path, false).is_err());
        Settings::write_default(&config_path, true).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.watcher, WatcherConfig::default());
    }

    #[test]
    fn test_layered_config() {
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let config_dir = temp_dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&config_dir).unwrap();

        let toml_content = r#"
[watcher]
dispatch_threads = 8
event_queue_capacity = 128
"#;
        fs::write(config_dir.join(CONFIG_FILE), toml_content).unwrap();

        // Environment variables override the config file
        unsafe {
            std::env::set_var("WATCHMUX_WATCHER__DISPATCH_THREADS", "16");
            std::env::set_var("WATCHMUX_WATCHER__SUBTREE_WATCHING", "false");
        }

        let settings = Settings::load().unwrap();

        assert_eq!(settings.watcher.dispatch_threads, 16);
        assert!(!settings.watcher.subtree_watching);
        // Config file value is used when no env var is set
        assert_eq!(settings.watcher.event_queue_capacity, 128);
        assert_eq!(settings.logging.default, "warn");

        unsafe {
            std::env::remove_var("WATCHMUX_WATCHER__DISPATCH_THREADS");
            std::env::remove_var("WATCHMUX_WATCHER__SUBTREE_WATCHING");
        }
        std::env::set_current_dir(original_dir).unwrap();
    }
}
