//! DependencyGraph - the resolved, immutable package graph.
//!
//! Nodes are package versions, edges point from a dependant to its
//! dependency. A resolved graph holds at most one version per package name
//! and is acyclic.

use std::collections::{BTreeMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::name::PackageName;
use crate::core::package_version::PackageVersion;

/// The resolved dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Package graph
    graph: DiGraph<PackageVersion, ()>,

    /// Map from package name to node index
    by_name: BTreeMap<PackageName, NodeIndex>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a package. A second version of an existing name is ignored.
    pub fn add_package(&mut self, package: PackageVersion) {
        if self.by_name.contains_key(package.name()) {
            return;
        }

        let name = package.name().clone();
        let node = self.graph.add_node(package);
        self.by_name.insert(name, node);
    }

    /// Add a dependency edge between two packages already in the graph.
    pub fn add_edge(&mut self, from: &PackageName, to: &PackageName) {
        if let (Some(&from_node), Some(&to_node)) = (self.by_name.get(from), self.by_name.get(to)) {
            if !self.graph.contains_edge(from_node, to_node) {
                self.graph.add_edge(from_node, to_node, ());
            }
        }
    }

    /// Get the resolved version of a package.
    pub fn get(&self, name: &str) -> Option<&PackageVersion> {
        self.by_name.get(name).map(|&n| &self.graph[n])
    }

    /// Iterate over all packages in name order.
    pub fn packages(&self) -> impl Iterator<Item = &PackageVersion> {
        self.by_name.values().map(|&n| &self.graph[n])
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Direct dependencies of a package, in name order.
    pub fn deps(&self, name: &str) -> Vec<&PackageVersion> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Packages that depend directly on the given package, in name order.
    pub fn dependents(&self, name: &str) -> Vec<&PackageVersion> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&PackageVersion> {
        let Some(&node) = self.by_name.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .neighbors_directed(node, dir)
            .map(|n| &self.graph[n])
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// Packages with dependencies before dependants.
    ///
    /// Post-order walk from each package in name order, visiting
    /// dependencies in name order, so the result is deterministic.
    pub fn dependency_order(&self) -> Vec<&PackageVersion> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.len());

        for name in self.by_name.keys() {
            self.visit(name, &mut visited, &mut order);
        }

        order
    }

    fn visit<'a>(
        &'a self,
        name: &str,
        visited: &mut HashSet<NodeIndex>,
        order: &mut Vec<&'a PackageVersion>,
    ) {
        let Some(&node) = self.by_name.get(name) else {
            return;
        };
        if !visited.insert(node) {
            return;
        }
        for dep in self.deps(name) {
            self.visit(dep.name(), visited, order);
        }
        order.push(&self.graph[node]);
    }

    /// Whether the graph contains a cycle. Resolved graphs never do.
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }
}
