//! Global context for berth operations.
//!
//! Provides centralized access to the berth home directory and the paths
//! derived from it: the artifact cache, environment roots, registry state
//! and configuration files.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};

use crate::core::manifest::MANIFEST_NAME;
use crate::util::config::{load_config, project_config_path, Config};

/// Environment variable that overrides the home directory.
pub const HOME_ENV: &str = "BERTH_HOME";

/// Project directories for berth
static PROJECT_DIRS: LazyLock<Option<ProjectDirs>> =
    LazyLock::new(|| ProjectDirs::from("dev", "berth", "berth"));

/// Global context containing paths and output settings.
#[derive(Debug, Clone)]
pub struct GlobalContext {
    /// Current working directory
    cwd: PathBuf,

    /// Home directory for global berth data
    home: PathBuf,

    /// Whether to use verbose output
    verbose: bool,

    /// Whether to use colors in output
    color: bool,
}

impl GlobalContext {
    /// Create a new GlobalContext with defaults.
    ///
    /// The home directory is `$BERTH_HOME` when set, otherwise the platform
    /// data directory, otherwise `~/.berth`.
    pub fn new() -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;

        let home = if let Some(home) = std::env::var_os(HOME_ENV) {
            PathBuf::from(home)
        } else if let Some(dirs) = PROJECT_DIRS.as_ref() {
            dirs.data_dir().to_path_buf()
        } else {
            BaseDirs::new()
                .map(|b| b.home_dir().join(".berth"))
                .unwrap_or_else(|| PathBuf::from(".berth"))
        };

        Ok(GlobalContext {
            cwd,
            home,
            verbose: false,
            color: true,
        })
    }

    /// Create a GlobalContext rooted at explicit directories.
    pub fn with_paths(cwd: PathBuf, home: PathBuf) -> Self {
        GlobalContext {
            cwd,
            home,
            verbose: false,
            color: true,
        }
    }

    /// Create a GlobalContext with a specific working directory.
    pub fn with_cwd(cwd: PathBuf) -> Result<Self> {
        let mut ctx = Self::new()?;
        ctx.cwd = cwd;
        Ok(ctx)
    }

    /// Set verbose mode.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Set color output.
    pub fn set_color(&mut self, color: bool) {
        self.color = color;
    }

    /// Get the current working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Get the berth home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Get the content-addressed artifact cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Get the directory holding environment roots.
    pub fn envs_dir(&self) -> PathBuf {
        self.home.join("envs")
    }

    /// Get the environment registry state file.
    pub fn state_path(&self) -> PathBuf {
        self.home.join("environments.toml")
    }

    /// Get the global configuration file path.
    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    /// Get the project-local berth directory.
    pub fn project_dir(&self) -> PathBuf {
        self.cwd.join(".berth")
    }

    /// Load the global config merged with the project config.
    pub fn load_config(&self) -> Config {
        load_config(&self.config_path(), &project_config_path(&self.cwd))
    }

    /// Check if verbose mode is enabled.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if color output is enabled.
    pub fn color(&self) -> bool {
        self.color
    }

    /// Install the tracing subscriber at this context's verbosity.
    pub fn init_logging(&self) -> Result<()> {
        crate::util::logging::init(self.verbose)
    }

    /// Render an error with its context and suggestions.
    pub fn render_error(&self, err: &crate::Error) -> String {
        err.to_diagnostic().format(self.color)
    }

    /// Find berth.toml starting from cwd and searching upward.
    pub fn find_manifest(&self) -> Option<PathBuf> {
        self.cwd
            .ancestors()
            .map(|dir| dir.join(MANIFEST_NAME))
            .find(|candidate| candidate.is_file())
    }
}
