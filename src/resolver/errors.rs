//! Resolution error types and diagnostics.

use miette::Diagnostic as MietteDiagnostic;
use thiserror::Error;

use crate::util::diagnostic::{suggestions, Diagnostic};

/// Requirer label used for constraints that come from the manifest itself.
pub const MANIFEST_REQUIRER: &str = "manifest";

/// Error during dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error, MietteDiagnostic)]
pub enum ResolveError {
    /// No version satisfies the collected constraints and no earlier
    /// decision has an alternative left.
    #[error("version conflict for `{package}`: {}", render_constraints(.constraints))]
    #[diagnostic(
        code(berth::resolve::conflict),
        help("relax one of the listed constraints")
    )]
    ResolutionConflict {
        package: String,
        /// (requirer, constraint) pairs that cannot hold together
        constraints: Vec<(String, String)>,
    },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    #[diagnostic(code(berth::resolve::cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("package not found: `{package}`")]
    #[diagnostic(code(berth::resolve::not_found))]
    PackageNotFound {
        package: String,
        required_by: Option<String>,
    },

    #[error("failed to query index for `{package}`: {message}")]
    #[diagnostic(code(berth::resolve::index))]
    Index { package: String, message: String },
}

fn render_constraints(constraints: &[(String, String)]) -> String {
    constraints
        .iter()
        .map(|(requirer, constraint)| format!("{} requires {}", requirer, constraint))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ResolveError {
    /// Convert to a user-friendly diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            ResolveError::ResolutionConflict {
                package,
                constraints,
            } => {
                let mut diag = Diagnostic::error(format!("version conflict for `{}`", package));

                for (requirer, constraint) in constraints {
                    diag = diag.with_context(format!(
                        "`{}` requires {} {}",
                        requirer, package, constraint
                    ));
                }

                diag.with_suggestion(format!(
                    "Relax one of the constraints on `{}` so a single version satisfies all",
                    package
                ))
                .with_suggestion(format!(
                    "Publish a version of `{}` matching every constraint",
                    package
                ))
            }

            ResolveError::CyclicDependency { cycle } => {
                Diagnostic::error("dependency cycle detected")
                    .with_context(format!("cycle: {}", cycle.join(" -> ")))
                    .with_suggestion(suggestions::CYCLE)
            }

            ResolveError::PackageNotFound {
                package,
                required_by,
            } => {
                let mut diag = Diagnostic::error(format!("could not find package `{}`", package));
                if let Some(requirer) = required_by {
                    diag = diag.with_context(format!("required by {}", requirer));
                }
                diag.with_suggestion(suggestions::PACKAGE_NOT_FOUND)
            }

            ResolveError::Index { package, message } => {
                Diagnostic::error(format!("failed to query index for `{}`", package))
                    .with_context(message.clone())
                    .with_suggestion("Verify the index location is readable")
            }
        }
    }
}
