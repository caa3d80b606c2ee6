//! Environment materialization.
//!
//! Turns a lockfile plus the artifact cache into an environment root: a
//! merged `include/ lib/ bin/ share/` layout, the lockfile itself and the
//! generated build descriptions. Work happens in a sibling staging
//! directory that replaces the root with a rename, so an environment is
//! either the old one or the complete new one.

pub mod description;
pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use miette::Diagnostic;
use rayon::prelude::*;
use thiserror::Error;

use crate::core::artifact::ArtifactKind;
use crate::resolver::encode::{LockedPackage, Lockfile, LOCKFILE_NAME};
use crate::sources::cache::{ArtifactCache, CacheError};
use crate::util::config::Config;
use crate::util::fs::{ensure_dir, remove_dir_all_if_exists};
use crate::util::lock::CancelToken;

pub use description::{BuildDescription, PackageDescription};
pub use layout::{derive_links, InstallSource, Installer, MaterializeMode};

/// Errors from materializing an environment.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    /// A cached artifact disappeared while it was being installed.
    #[error("artifact {fingerprint} of {package} vanished from {}", .path.display())]
    #[diagnostic(code(berth::build::artifact_missing))]
    ArtifactMissing {
        package: String,
        fingerprint: String,
        path: PathBuf,
    },

    #[error(
        "layout conflict at `{}`: {first} and {second} install different content",
        .path.display()
    )]
    #[diagnostic(
        code(berth::build::layout_conflict),
        help("remove one of the two packages or use versions that agree on this file")
    )]
    LayoutConflict {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("materialization of environment `{name}` was cancelled")]
    #[diagnostic(code(berth::build::cancelled))]
    Cancelled { name: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error("{message}")]
    #[diagnostic(code(berth::build::io))]
    Io { message: String },
}

impl BuildError {
    fn io(err: anyhow::Error) -> Self {
        BuildError::Io {
            message: format!("{:#}", err),
        }
    }
}

/// Builds environment roots from lockfiles.
pub struct EnvironmentBuilder {
    cache: Arc<ArtifactCache>,
    mode: MaterializeMode,
    max_attempts: u32,
    cancel: CancelToken,
}

impl EnvironmentBuilder {
    pub fn new(cache: Arc<ArtifactCache>, config: &Config) -> Self {
        EnvironmentBuilder {
            cache,
            mode: config.materialize_mode(),
            max_attempts: config.max_attempts(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_mode(mut self, mode: MaterializeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Observe `cancel` between steps.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn mode(&self) -> MaterializeMode {
        self.mode
    }

    /// Materialize `lockfile` as environment `name` at `root`.
    ///
    /// The result depends only on the lockfile, the cache contents and
    /// `root`; running it twice yields identical trees.
    pub fn materialize(
        &self,
        name: &str,
        lockfile: &Lockfile,
        root: &Path,
    ) -> Result<BuildDescription, BuildError> {
        let parent = root.parent().unwrap_or(Path::new("."));
        ensure_dir(parent).map_err(BuildError::io)?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-staging-", name))
            .tempdir_in(parent)
            .context("failed to create staging directory")
            .map_err(BuildError::io)?;

        tracing::info!(
            "Materializing environment `{}` ({} packages)",
            name,
            lockfile.packages.len()
        );

        let acquired = lockfile
            .packages
            .par_iter()
            .map(|pkg| self.acquire(name, pkg))
            .collect::<Result<Vec<PathBuf>, BuildError>>()?;

        let mut installer = Installer::new(staging.path(), self.mode);
        let mut packages = Vec::with_capacity(lockfile.packages.len());
        for (pkg, path) in lockfile.packages.iter().zip(acquired) {
            self.check_cancelled(name)?;
            let path =
                self.install_with_retry(&mut installer, pkg, path, || self.acquire(name, pkg))?;

            let links = if pkg.links.is_empty() {
                derive_links(&path.join("lib"))
            } else {
                pkg.links.clone()
            };
            packages.push(PackageDescription {
                name: pkg.name.to_string(),
                version: pkg.version.to_string(),
                fingerprint: pkg.fingerprint.clone(),
                kind: pkg.kind,
                links,
                options: pkg.options.clone(),
                source_dir: (pkg.kind == ArtifactKind::Source)
                    .then(|| root.join(layout::SRC_DIR).join(source_dir_name(pkg))),
            });
        }

        let present = |sub: &str| -> Vec<PathBuf> {
            if staging.path().join(sub).is_dir() {
                vec![root.join(sub)]
            } else {
                Vec::new()
            }
        };
        let description = BuildDescription {
            environment: name.to_string(),
            root: root.to_path_buf(),
            include_dirs: present("include"),
            library_dirs: present("lib"),
            bin_dirs: present("bin"),
            link_libraries: packages.iter().flat_map(|p| p.links.clone()).collect(),
            packages,
        };

        lockfile
            .save(&staging.path().join(LOCKFILE_NAME))
            .map_err(BuildError::io)?;
        description.write_all(staging.path()).map_err(BuildError::io)?;

        self.check_cancelled(name)?;
        swap_into_place(staging.path(), root, name).map_err(BuildError::io)?;

        tracing::info!("Environment `{}` ready at {}", name, root.display());
        Ok(description)
    }

    fn acquire(&self, name: &str, pkg: &LockedPackage) -> Result<PathBuf, BuildError> {
        self.cache
            .acquire_with(&pkg.artifact(), &self.cancel)
            .map_err(|e| match e {
                CacheError::Cancelled { .. } => BuildError::Cancelled {
                    name: name.to_string(),
                },
                other => BuildError::Cache(other),
            })
    }

    /// Install one package, calling `reacquire` for a fresh path whenever
    /// the artifact vanishes, up to the attempt bound.
    fn install_with_retry(
        &self,
        installer: &mut Installer,
        pkg: &LockedPackage,
        mut path: PathBuf,
        mut reacquire: impl FnMut() -> Result<PathBuf, BuildError>,
    ) -> Result<PathBuf, BuildError> {
        let package = format!("{} v{}", pkg.name, pkg.version);
        let mut attempt = 1;
        loop {
            let source = InstallSource {
                package: &package,
                fingerprint: &pkg.fingerprint,
                root: &path,
            };
            let result = installer.install(source).and_then(|()| {
                if pkg.kind == ArtifactKind::Source {
                    installer.install_source_tree(source, &source_dir_name(pkg))
                } else {
                    Ok(())
                }
            });

            match result {
                Ok(()) => return Ok(path),
                Err(e @ BuildError::ArtifactMissing { .. }) if attempt < self.max_attempts => {
                    tracing::warn!("{}; acquiring it again", e);
                    attempt += 1;
                    path = reacquire()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_cancelled(&self, name: &str) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

fn source_dir_name(pkg: &LockedPackage) -> String {
    format!("{}-{}", pkg.name, pkg.version)
}

/// Replace `root` with `staging` using renames only.
fn swap_into_place(staging: &Path, root: &Path, name: &str) -> anyhow::Result<()> {
    let parent = root.parent().unwrap_or(Path::new("."));

    if std::fs::symlink_metadata(root).is_err() {
        return std::fs::rename(staging, root)
            .with_context(|| format!("failed to move environment into {}", root.display()));
    }

    let retired = tempfile::Builder::new()
        .prefix(&format!(".{}-old-", name))
        .tempdir_in(parent)
        .context("failed to create directory for the previous environment")?;
    let old = retired.path().join("env");

    std::fs::rename(root, &old)
        .with_context(|| format!("failed to move aside {}", root.display()))?;
    if let Err(e) = std::fs::rename(staging, root) {
        // Put the previous environment back.
        if let Err(restore) = std::fs::rename(&old, root) {
            tracing::warn!("Failed to restore {}: {}", root.display(), restore);
        }
        return Err(e)
            .with_context(|| format!("failed to move environment into {}", root.display()));
    }

    remove_dir_all_if_exists(retired.path())
}
