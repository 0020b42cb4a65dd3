//! Configuration management for the qplay engine
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--cache-dir`, `--precache-depth`, ...)
//! 2. Config file named on the command line or by `QPLAY_CONFIG`
//! 3. Platform config file (`<config_dir>/qplay/config.toml`)
//! 4. Built-in defaults (code constants)
//!
//! Every field has a built-in default, so an empty or partial TOML file is
//! valid. Values are validated after overrides are applied.

use crate::error::{Error, Result};
use qplay_common::config::{default_data_dir, ConfigFileResolver, ConfigSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application name used for config/data folder lookup
pub const APP_NAME: &str = "qplay";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Folder downloaded media is cached in
    pub cache_dir: PathBuf,

    /// Number of leading queue entries kept preparing or cached
    pub precache_depth: usize,

    /// Volume a new player starts with (0.0-1.0)
    pub default_volume: f32,

    /// Width of the download worker pool
    pub max_concurrent_downloads: usize,

    /// Fixed delay before the pull loop moves past an unplayable entry
    pub retry_backoff_ms: u64,

    /// Never delete the backing file of a retired entry
    pub keep_downloads: bool,

    /// Start the pull loop when an entry lands in an idle player's playlist
    pub auto_playback: bool,

    /// Broadcast buffer size of the session event bus
    pub event_capacity: usize,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "qplay_engine=debug,qplay=info".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_data_dir(APP_NAME).join("cache"),
            precache_depth: 1,
            default_volume: 0.15,
            max_concurrent_downloads: 2,
            retry_backoff_ms: 500,
            keep_downloads: false,
            auto_playback: true,
            event_capacity: 100,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file (if any) and apply command-line overrides
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let resolver = ConfigFileResolver::new(APP_NAME);
        let (mut config, source): (EngineConfig, ConfigSource) = resolver.load(config_path)?;

        match source.path() {
            Some(path) => info!("Engine configuration from {}", path.display()),
            None => info!("Engine configuration: built-in defaults"),
        }

        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides in place
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(dir) = overrides.cache_dir {
            self.cache_dir = dir;
        }
        if let Some(depth) = overrides.precache_depth {
            self.precache_depth = depth;
        }
        if let Some(volume) = overrides.default_volume {
            self.default_volume = volume;
        }
        if let Some(keep) = overrides.keep_downloads {
            self.keep_downloads = keep;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.precache_depth == 0 {
            return Err(Error::Config("precache_depth must be at least 1".to_string()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.default_volume) {
            return Err(Error::Config(format!(
                "default_volume {} outside 0.0-1.0",
                self.default_volume
            )));
        }
        Ok(())
    }

    /// Pull-loop backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        qplay_common::time::millis_to_duration(self.retry_backoff_ms)
    }
}

/// Command-line configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cache_dir: Option<PathBuf>,
    pub precache_depth: Option<usize>,
    pub default_volume: Option<f32>,
    pub keep_downloads: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.precache_depth, 1);
        assert_eq!(config.default_volume, 0.15);
        assert_eq!(config.retry_backoff(), Duration::from_millis(500));
        assert!(config.auto_playback);
        assert!(!config.keep_downloads);
        assert!(config.cache_dir.ends_with("cache"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            precache_depth = 3
            keep_downloads = true

            [logging]
            filter = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.precache_depth, 3);
        assert!(config.keep_downloads);
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.max_concurrent_downloads, 2);
    }

    #[test]
    fn test_overrides_win() {
        let mut config = EngineConfig::default();
        config.apply(ConfigOverrides {
            cache_dir: Some(PathBuf::from("/tmp/qplay-cache")),
            precache_depth: Some(4),
            default_volume: Some(0.5),
            keep_downloads: Some(true),
        });

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/qplay-cache"));
        assert_eq!(config.precache_depth, 4);
        assert_eq!(config.default_volume, 0.5);
        assert!(config.keep_downloads);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.precache_depth = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.default_volume = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qplay.toml");
        std::fs::write(&path, "retry_backoff_ms = 50\nauto_playback = false\n").unwrap();

        let config = EngineConfig::load(
            Some(&path),
            ConfigOverrides {
                precache_depth: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.retry_backoff_ms, 50);
        assert!(!config.auto_playback);
        assert_eq!(config.precache_depth, 2);
    }
}
