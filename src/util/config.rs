//! Configuration file support for berth.
//!
//! berth reads two configuration file locations:
//! - Global: `<home>/config.toml` - User-wide defaults
//! - Project: `.berth/config.toml` - Project-specific overrides
//!
//! Project config takes precedence over global config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::builder::layout::MaterializeMode;

/// Attempts per artifact when nothing is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Network timeout when nothing is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// berth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Artifact cache settings
    pub cache: CacheConfig,

    /// Network settings
    pub net: NetConfig,

    /// Environment materialization settings
    pub env: EnvConfig,
}

/// Cache-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size ceiling in bytes; unreferenced entries are evicted above it
    pub max_size: Option<u64>,

    /// Fetch attempts per artifact before giving up
    pub max_attempts: Option<u32>,
}

/// Network-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Fetch timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Offline mode (only `file://` mirrors are used)
    #[serde(default)]
    pub offline: bool,
}

/// Environment-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// How artifact files are placed into environments
    pub materialize: Option<MaterializeMode>,
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load configuration with fallback to defaults if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        }
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(&mut self, other: Config) {
        if other.cache.max_size.is_some() {
            self.cache.max_size = other.cache.max_size;
        }
        if other.cache.max_attempts.is_some() {
            self.cache.max_attempts = other.cache.max_attempts;
        }

        if other.net.timeout_secs.is_some() {
            self.net.timeout_secs = other.net.timeout_secs;
        }
        if other.net.offline {
            self.net.offline = true;
        }

        if other.env.materialize.is_some() {
            self.env.materialize = other.env.materialize;
        }
    }

    /// Fetch attempts per artifact, at least one.
    pub fn max_attempts(&self) -> u32 {
        self.cache.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1)
    }

    /// Network fetch timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.net.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// Materialization mode for new environments.
    pub fn materialize_mode(&self) -> MaterializeMode {
        self.env.materialize.unwrap_or_default()
    }
}

/// Load merged configuration from global and project locations.
///
/// Order of precedence (highest to lowest):
/// 1. Project config (.berth/config.toml)
/// 2. Global config (<home>/config.toml)
/// 3. Defaults
pub fn load_config(global_path: &Path, project_path: &Path) -> Config {
    let mut config = Config::default();

    // Load global config first
    if global_path.exists() {
        let global = Config::load_or_default(global_path);
        config.merge(global);
    }

    // Project config overrides global
    if project_path.exists() {
        let project = Config::load_or_default(project_path);
        config.merge(project);
    }

    config
}

/// Get the project config path (.berth/config.toml).
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".berth").join("config.toml")
}
