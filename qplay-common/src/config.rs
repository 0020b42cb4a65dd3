//! Configuration file resolution and default folders
//!
//! Config file lookup follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`<APP>_CONFIG`)
//! 3. Platform config file (`<config_dir>/<app>/config.toml`)
//! 4. Built-in defaults (fallback)
//!
//! An explicitly named file (CLI or environment) must exist. The platform
//! file is optional; when it is absent the built-in defaults apply.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where a resolved configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path given on the command line
    CommandLine(PathBuf),
    /// Path named by the environment variable
    Environment(PathBuf),
    /// Platform default config file
    PlatformFile(PathBuf),
    /// No file; built-in defaults
    Defaults,
}

impl ConfigSource {
    /// File backing this source, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::CommandLine(p)
            | ConfigSource::Environment(p)
            | ConfigSource::PlatformFile(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

/// Resolves and loads an application's TOML config file
#[derive(Debug, Clone)]
pub struct ConfigFileResolver {
    app_name: String,
    env_var_name: String,
}

impl ConfigFileResolver {
    /// Resolver for `app_name`, reading `<APP_NAME>_CONFIG` from the environment
    pub fn new(app_name: &str) -> Self {
        let env_var_name = format!("{}_CONFIG", app_name.to_uppercase().replace('-', "_"));
        Self {
            app_name: app_name.to_string(),
            env_var_name,
        }
    }

    /// Environment variable consulted at priority 2
    pub fn env_var_name(&self) -> &str {
        &self.env_var_name
    }

    /// Work out which config source applies
    pub fn resolve(&self, cli_arg: Option<&Path>) -> ConfigSource {
        if let Some(path) = cli_arg {
            return ConfigSource::CommandLine(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(&self.env_var_name) {
            if !path.is_empty() {
                return ConfigSource::Environment(PathBuf::from(path));
            }
        }

        match platform_config_file(&self.app_name) {
            Some(path) if path.exists() => ConfigSource::PlatformFile(path),
            _ => ConfigSource::Defaults,
        }
    }

    /// Resolve and parse the config file into `T`
    ///
    /// Returns `T::default()` when no file applies.
    pub fn load<T>(&self, cli_arg: Option<&Path>) -> Result<(T, ConfigSource)>
    where
        T: DeserializeOwned + Default,
    {
        let source = self.resolve(cli_arg);

        let Some(path) = source.path() else {
            debug!("No config file for {}, using built-in defaults", self.app_name);
            return Ok((T::default(), source));
        };

        let value = load_toml_file(path)?;
        info!("Loaded configuration from {}", path.display());
        Ok((value, source))
    }
}

/// Parse a TOML file into `T`
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Platform config file path for `app_name`
pub fn platform_config_file(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(app_name).join("config.toml"))
}

/// OS-dependent default data folder for `app_name`
pub fn default_data_dir(app_name: &str) -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/<app> (or /var/lib/<app> without a home directory)
        dirs::data_local_dir()
            .map(|d| d.join(app_name))
            .unwrap_or_else(|| PathBuf::from("/var/lib").join(app_name))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join(app_name))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support").join(app_name))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join(app_name))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData").join(app_name))
    } else {
        PathBuf::from(format!("./{}_data", app_name))
    }
}
