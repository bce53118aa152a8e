//! Dependency graph between runner names.
//!
//! Design:
//! - Forward edges: runner -> upstream runners it waits for
//! - Reverse edges: runner -> downstream runners waiting for it
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

/// Dependency graph keyed by runner name.
///
/// Upstream sets are ordered so error messages and cycle paths are
/// deterministic.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Forward edges: runner -> runners it depends on
    edges: HashMap<String, BTreeSet<String>>,

    /// Reverse edges: runner -> runners that depend on it
    reverse_edges: HashMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `runner` waits for `depends_on`.
    pub fn add_dependency(&mut self, runner: &str, depends_on: &str) {
        self.edges
            .entry(runner.to_string())
            .or_default()
            .insert(depends_on.to_string());
        self.reverse_edges
            .entry(depends_on.to_string())
            .or_default()
            .insert(runner.to_string());
    }

    pub fn remove_dependency(&mut self, runner: &str, depends_on: &str) {
        if let Entry::Occupied(mut e) = self.edges.entry(runner.to_string()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on.to_string()) {
            e.get_mut().remove(runner);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drop every edge leaving `runner`.
    pub fn remove_runner(&mut self, runner: &str) {
        for upstream in self.dependencies_of(runner) {
            self.remove_dependency(runner, &upstream);
        }
    }

    /// Runners waiting for `upstream`.
    pub fn dependents_of(&self, upstream: &str) -> Vec<String> {
        self.reverse_edges
            .get(upstream)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, runner: &str) -> bool {
        self.edges.get(runner).is_some_and(|deps| !deps.is_empty())
    }

    pub fn dependencies_of(&self, runner: &str) -> Vec<String> {
        self.edges
            .get(runner)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// First cycle found by depth-first search, as a path that starts and
    /// ends on the same runner. `None` for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut colors: HashMap<&str, Color> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();

        let mut starts: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        starts.sort_unstable();
        for start in starts {
            if colors.contains_key(start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                match colors.get(dep.as_str()) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.visit(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
