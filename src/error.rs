//! Crate-level error type.
//!
//! Each component has its own typed error; this enum gathers them for the
//! registry surface. Anything without a component home (filesystem context
//! from internal helpers) lands in `Other`.

use miette::Diagnostic;
use thiserror::Error;

use crate::builder::BuildError;
use crate::core::manifest::ManifestError;
use crate::ops::registry::EnvError;
use crate::resolver::errors::ResolveError;
use crate::sources::cache::CacheError;
use crate::util::diagnostic::{suggestions, Diagnostic as Report};

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    #[diagnostic(code(berth::other))]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Cache(CacheError::FetchFailed { .. })
                | Error::Build(BuildError::ArtifactMissing { .. })
                | Error::Env(EnvError::EnvironmentBusy { .. })
        )
    }

    /// Render as a human diagnostic with context and next steps.
    pub fn to_diagnostic(&self) -> Report {
        match self {
            Error::Resolve(e) => e.to_diagnostic(),
            Error::Cache(CacheError::FetchFailed {
                fingerprint,
                attempts,
                message,
            }) => Report::error(format!("could not fetch artifact {}", fingerprint))
                .with_context(format!("gave up after {} attempt(s)", attempts))
                .with_context(message.clone())
                .with_suggestion(suggestions::FETCH_FAILED),
            Error::Build(BuildError::LayoutConflict {
                path,
                first,
                second,
            }) => Report::error(format!("two packages install `{}`", path.display()))
                .with_context(format!("{} and {} ship different content", first, second))
                .with_location(path.clone())
                .with_suggestion("Remove one of the packages from the manifest"),
            Error::Env(EnvError::EnvironmentBusy { name, refs }) => {
                Report::warning(format!("environment `{}` is still in use", name))
                    .with_context(format!("{} active reference(s)", refs))
                    .with_suggestion("Release every lease on the environment and retry")
            }
            other => Report::error(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_convert() {
        let err: Error = EnvError::NotFound {
            name: "demo".into(),
        }
        .into();
        assert_eq!(err.to_string(), "environment `demo` does not exist");
        assert!(!err.is_transient());

        let err: Error = EnvError::EnvironmentBusy {
            name: "demo".into(),
            refs: 2,
        }
        .into();
        assert!(err.is_transient());
        assert_eq!(
            err.code().map(|c| c.to_string()).as_deref(),
            Some("berth::env::busy")
        );
        assert!(err.to_diagnostic().format(false).contains("2 active reference(s)"));
    }

    #[test]
    fn test_fetch_failure_diagnostic() {
        let err: Error = CacheError::FetchFailed {
            fingerprint: "ab".repeat(32),
            attempts: 3,
            message: "connection refused".into(),
        }
        .into();
        let output = err.to_diagnostic().format(false);
        assert!(output.contains("gave up after 3 attempt(s)"));
        assert!(output.contains(suggestions::FETCH_FAILED));
    }
}
