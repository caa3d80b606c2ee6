//! Dependency resolution.
//!
//! The resolver is a backtracking search over package versions. All index
//! I/O happens up front in `load_candidates`; the search itself is pure and
//! deterministic given the same candidate lists.
//!
//! Search state lives in immutable snapshots. Every decision records the
//! snapshot taken before it together with the versions it has not tried
//! yet, so backtracking is just resuming from an older snapshot.

pub mod encode;
pub mod errors;
pub mod graph;

pub use encode::{LockedPackage, Lockfile};
pub use errors::ResolveError;
pub use graph::DependencyGraph;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use crate::core::constraint::VersionConstraint;
use crate::core::dependency::Dependency;
use crate::core::manifest::Manifest;
use crate::core::name::PackageName;
use crate::core::package_id::PackageId;
use crate::core::package_version::PackageVersion;
use crate::resolver::errors::MANIFEST_REQUIRER;
use crate::sources::index::PackageIndex;

/// Available versions per package name, newest first.
type Candidates = BTreeMap<PackageName, Vec<PackageVersion>>;

/// Resolve a manifest against an index.
pub fn resolve(
    manifest: &Manifest,
    index: &dyn PackageIndex,
) -> Result<DependencyGraph, ResolveError> {
    Resolver::new(index).resolve(&manifest.dependencies())
}

/// Resolves root dependencies to one version per package.
pub struct Resolver<'a> {
    index: &'a dyn PackageIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a dyn PackageIndex) -> Self {
        Resolver { index }
    }

    /// Resolve the given root dependencies.
    pub fn resolve(&self, roots: &[Dependency]) -> Result<DependencyGraph, ResolveError> {
        if roots.is_empty() {
            return Ok(DependencyGraph::new());
        }

        let candidates = self.load_candidates(roots)?;
        check_cycles(roots, &candidates)?;

        let chosen = Search {
            candidates: &candidates,
        }
        .run(roots)?;

        let mut graph = DependencyGraph::new();
        for version in chosen.values() {
            graph.add_package(version.clone());
        }
        for version in chosen.values() {
            for dep in version.dependencies() {
                graph.add_edge(version.name(), dep.name());
            }
        }

        tracing::info!("resolved {} packages", graph.len());
        Ok(graph)
    }

    /// Query every package name reachable from the roots.
    fn load_candidates(&self, roots: &[Dependency]) -> Result<Candidates, ResolveError> {
        let mut candidates = Candidates::new();
        let mut queue: VecDeque<PackageName> = roots.iter().map(|d| d.name().clone()).collect();

        while let Some(name) = queue.pop_front() {
            if candidates.contains_key(&name) {
                continue;
            }

            let mut versions = self
                .index
                .query(&name)
                .map_err(|e| ResolveError::Index {
                    package: name.to_string(),
                    message: format!("{:#}", e),
                })?;
            versions.sort_by(|a, b| b.version().cmp(a.version()));
            versions.dedup_by(|a, b| a.version() == b.version());

            for version in &versions {
                for dep in version.dependencies() {
                    if !candidates.contains_key(dep.name()) {
                        queue.push_back(dep.name().clone());
                    }
                }
            }

            tracing::debug!("{} has {} candidate versions", name, versions.len());
            candidates.insert(name, versions);
        }

        Ok(candidates)
    }
}

/// Reject dependency cycles before searching.
///
/// Walks package names depth-first, following the dependencies of every
/// version that satisfies the constraint on the incoming edge. A name that
/// reappears on the active stack is a cycle.
fn check_cycles(roots: &[Dependency], candidates: &Candidates) -> Result<(), ResolveError> {
    let mut stack = Vec::new();
    let mut done = HashSet::new();
    for root in roots {
        walk(root, candidates, &mut stack, &mut done)?;
    }
    Ok(())
}

fn walk(
    dep: &Dependency,
    candidates: &Candidates,
    stack: &mut Vec<PackageName>,
    done: &mut HashSet<(PackageName, String)>,
) -> Result<(), ResolveError> {
    if let Some(pos) = stack.iter().position(|n| n == dep.name()) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
        cycle.push(dep.name().to_string());
        return Err(ResolveError::CyclicDependency { cycle });
    }

    let key = (dep.name().clone(), dep.constraint().to_string());
    if done.contains(&key) {
        return Ok(());
    }

    stack.push(dep.name().clone());
    for version in candidates
        .get(dep.name())
        .into_iter()
        .flatten()
        .filter(|v| dep.matches_version(v.version()))
    {
        for next in version.dependencies() {
            walk(next, candidates, stack, done)?;
        }
    }
    stack.pop();

    done.insert(key);
    Ok(())
}

/// One constraint on a package and who imposed it.
#[derive(Debug, Clone)]
struct Requirement {
    constraint: VersionConstraint,
    /// `None` for manifest constraints
    required_by: Option<PackageId>,
}

impl Requirement {
    fn requirer(&self) -> String {
        match &self.required_by {
            Some(id) => id.to_string(),
            None => MANIFEST_REQUIRER.to_string(),
        }
    }
}

/// Immutable search state.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    /// Every constraint collected so far, per package name
    requirements: BTreeMap<PackageName, Vec<Requirement>>,
    /// Versions decided so far
    chosen: BTreeMap<PackageName, PackageVersion>,
    /// Names that are required but not yet decided, in discovery order
    pending: VecDeque<PackageName>,
}

/// A version choice that can be revisited.
struct Decision {
    package: PackageName,
    before: Arc<Snapshot>,
    /// Untried versions, newest first
    alternatives: VecDeque<PackageVersion>,
    /// Packages implicated in every conflict that led back to this decision
    blame: BTreeSet<PackageName>,
}

/// A package whose collected requirements admit no version.
struct Conflict {
    package: PackageName,
    state: Snapshot,
}

struct Search<'c> {
    candidates: &'c Candidates,
}

impl Search<'_> {
    fn run(
        &self,
        roots: &[Dependency],
    ) -> Result<BTreeMap<PackageName, PackageVersion>, ResolveError> {
        let mut state = match self.seed(roots) {
            Ok(state) => state,
            Err(conflict) => return Err(self.report(conflict)),
        };
        let mut decisions: Vec<Decision> = Vec::new();

        while let Some(name) = state.pending.front().cloned() {
            let mut options: VecDeque<PackageVersion> = self.admissible(&state, &name).into();
            let before = Arc::new(state);

            let outcome = match options.pop_front() {
                Some(version) => {
                    tracing::debug!("choosing {} ({} alternatives)", version, options.len());
                    let outcome = self.apply(&before, &version);
                    decisions.push(Decision {
                        package: name,
                        before: Arc::clone(&before),
                        alternatives: options,
                        blame: BTreeSet::new(),
                    });
                    outcome
                }
                None => Err(Conflict {
                    package: name,
                    state: (*before).clone(),
                }),
            };

            state = match outcome {
                Ok(next) => next,
                Err(conflict) => self.backjump(&mut decisions, conflict)?,
            };
        }

        Ok(state.chosen)
    }

    /// Initial snapshot holding the manifest constraints, seeded in name order.
    fn seed(&self, roots: &[Dependency]) -> Result<Snapshot, Conflict> {
        let mut roots: Vec<&Dependency> = roots.iter().collect();
        roots.sort_by(|a, b| a.name().cmp(b.name()));

        let mut state = Snapshot::default();
        for dep in roots {
            let requirement = Requirement {
                constraint: dep.constraint().clone(),
                required_by: None,
            };
            if let Err(package) = self.require(&mut state, dep.name(), requirement) {
                return Err(Conflict { package, state });
            }
        }
        Ok(state)
    }

    /// Versions of `name` that satisfy every collected requirement.
    fn admissible(&self, state: &Snapshot, name: &PackageName) -> Vec<PackageVersion> {
        let requirements = state
            .requirements
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        self.candidates
            .get(name)
            .into_iter()
            .flatten()
            .filter(|v| requirements.iter().all(|r| r.constraint.matches(v.version())))
            .cloned()
            .collect()
    }

    /// Merge a requirement into `state`. Constraints only ever tighten.
    ///
    /// Fails with the package name when the requirement rejects the version
    /// already chosen, or leaves no admissible version.
    fn require(
        &self,
        state: &mut Snapshot,
        name: &PackageName,
        requirement: Requirement,
    ) -> Result<(), PackageName> {
        let accepted = match state.chosen.get(name) {
            Some(version) => requirement.constraint.matches(version.version()),
            None => true,
        };
        state
            .requirements
            .entry(name.clone())
            .or_default()
            .push(requirement);

        if !accepted {
            return Err(name.clone());
        }

        if !state.chosen.contains_key(name) {
            if self.admissible(state, name).is_empty() {
                return Err(name.clone());
            }
            if !state.pending.contains(name) {
                state.pending.push_back(name.clone());
            }
        }
        Ok(())
    }

    /// Choose `version` on top of `before`, producing a new snapshot.
    fn apply(&self, before: &Snapshot, version: &PackageVersion) -> Result<Snapshot, Conflict> {
        let mut state = before.clone();
        state.pending.retain(|n| n != version.name());
        state.chosen.insert(version.name().clone(), version.clone());

        let id = version.package_id();
        for dep in version.dependencies() {
            let requirement = Requirement {
                constraint: dep.constraint().clone(),
                required_by: Some(id.clone()),
            };
            if let Err(package) = self.require(&mut state, dep.name(), requirement) {
                return Err(Conflict { package, state });
            }
        }
        Ok(state)
    }

    /// Resume from the most recent decision implicated in the conflict that
    /// still has an untried version.
    ///
    /// Decisions outside the conflict set are unwound without trying their
    /// alternatives. A decision whose versions are all used up passes every
    /// conflict collected under it on to the decisions before it, so a
    /// package that caused an earlier failure is never skipped.
    fn backjump(
        &self,
        decisions: &mut Vec<Decision>,
        mut conflict: Conflict,
    ) -> Result<Snapshot, ResolveError> {
        let mut blame = causal_chain(&conflict);
        loop {
            tracing::debug!("conflict on {}; implicated: {:?}", conflict.package, blame);

            let mut resumed = None;
            while let Some(mut decision) = decisions.pop() {
                if !blame.contains(&decision.package) {
                    continue;
                }
                decision.blame.append(&mut blame);
                if let Some(next) = decision.alternatives.pop_front() {
                    resumed = Some((decision, next));
                    break;
                }
                blame = std::mem::take(&mut decision.blame);
                blame.remove(&decision.package);
            }

            let Some((decision, next)) = resumed else {
                return Err(self.report(conflict));
            };

            tracing::debug!("backtracking: trying {}", next);
            let outcome = self.apply(&decision.before, &next);
            decisions.push(decision);

            match outcome {
                Ok(state) => return Ok(state),
                Err(next_conflict) => {
                    blame = causal_chain(&next_conflict);
                    conflict = next_conflict;
                }
            }
        }
    }

    /// Turn an unrecoverable conflict into an error with a minimal set of
    /// colliding constraints.
    fn report(&self, conflict: Conflict) -> ResolveError {
        let package = conflict.package;
        let mut requirements = conflict
            .state
            .requirements
            .get(&package)
            .cloned()
            .unwrap_or_default();
        let available = self.candidates.get(&package).map(Vec::as_slice).unwrap_or(&[]);

        if available.is_empty() {
            return ResolveError::PackageNotFound {
                package: package.to_string(),
                required_by: requirements.first().map(Requirement::requirer),
            };
        }

        // Greedy minimization: drop a requirement when the rest still admit
        // no available version.
        let mut i = 0;
        while i < requirements.len() {
            let satisfiable_without = available.iter().any(|v| {
                requirements
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .all(|(_, r)| r.constraint.matches(v.version()))
            });
            if satisfiable_without {
                i += 1;
            } else {
                requirements.remove(i);
            }
        }

        ResolveError::ResolutionConflict {
            package: package.to_string(),
            constraints: requirements
                .iter()
                .map(|r| (r.requirer(), r.constraint.to_string()))
                .collect(),
        }
    }
}

/// The conflicted package plus everything that transitively required it.
fn causal_chain(conflict: &Conflict) -> BTreeSet<PackageName> {
    let mut chain = BTreeSet::new();
    let mut queue = vec![conflict.package.clone()];

    while let Some(name) = queue.pop() {
        if !chain.insert(name.clone()) {
            continue;
        }
        for requirement in conflict.state.requirements.get(&name).into_iter().flatten() {
            if let Some(id) = &requirement.required_by {
                queue.push(id.name().clone());
            }
        }
    }

    chain
}
