//! berth - isolated build environments for native (C/C++) projects
//!
//! A manifest declares required packages and version constraints. berth
//! resolves one version per package against a package index, fetches each
//! artifact into a content-addressed cache and materializes a
//! self-contained environment of headers, libraries and generated build
//! descriptions that an external build system can consume.
//!
//! The entry point is [`EnvironmentRegistry`]:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use berth::{Config, DirectoryIndex, EnvironmentRegistry, GlobalContext, Manifest, UrlFetcher};
//!
//! # fn main() -> berth::Result<()> {
//! let context = GlobalContext::new()?;
//! let config = context.load_config();
//! let fetcher = Arc::new(UrlFetcher::from_config(&config)?);
//! let index = Arc::new(DirectoryIndex::new("/srv/berth-index"));
//!
//! let registry = EnvironmentRegistry::open(context, config, index, fetcher)?;
//! let manifest = Manifest::load("berth.toml".as_ref())?;
//! let env = registry.create("demo", &manifest)?;
//! println!("environment ready at {}", env.root.display());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod core;
pub mod error;
pub mod ops;
pub mod resolver;
pub mod sources;
pub mod util;

/// Fixtures and fakes for unit tests.
#[cfg(test)]
pub mod test_support;

pub use crate::core::{
    Artifact, ArtifactKind, Dependency, Fingerprint, Manifest, ManifestError, PackageName,
    PackageSpec, PackageVersion, VersionConstraint,
};
pub use builder::{BuildDescription, BuildError, EnvironmentBuilder, MaterializeMode};
pub use error::{Error, Result};
pub use ops::{
    EnvError, EnvironmentLease, EnvironmentRegistry, EnvironmentSummary, GcReport,
    VirtualEnvironment,
};
pub use resolver::{resolve, DependencyGraph, Lockfile, ResolveError};
pub use sources::{
    ArtifactCache, CacheError, DirectoryIndex, Fetcher, MemoryIndex, PackageIndex, UrlFetcher,
};
pub use util::{CancelToken, Config, GlobalContext};
