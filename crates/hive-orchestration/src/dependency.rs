//! Dependency resolution between services.
//!
//! Edges point from a dependency to its dependents. Every ordering method is
//! deterministic: ties are broken by service name.

use crate::{Error, Result, config::ServiceConfig};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Dependency graph over configured services
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// dependency -> services that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// service -> its direct dependencies
    dependencies: BTreeMap<String, BTreeSet<String>>,
    nodes: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names, unknown references and cycles
    pub fn from_configs(configs: &[ServiceConfig]) -> Result<Self> {
        let mut graph = Self::default();

        for config in configs {
            if !graph.nodes.insert(config.name.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "service '{}' is defined more than once",
                    config.name
                )));
            }
        }

        for config in configs {
            for dep in config.dependency_names() {
                if !graph.nodes.contains(dep) {
                    return Err(Error::MissingDependency {
                        service: config.name.clone(),
                        dependency: dep.to_string(),
                    });
                }
                graph
                    .dependents
                    .entry(dep.to_string())
                    .or_default()
                    .insert(config.name.clone());
                graph
                    .dependencies
                    .entry(config.name.clone())
                    .or_default()
                    .insert(dep.to_string());
            }
        }

        graph.topological_sort()?;
        Ok(graph)
    }

    /// Whether `name` is a node of the graph
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains(name)
    }

    /// Direct dependencies of `name`
    pub fn direct_dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Perform topological sort to find the start order
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// The partial order as batches of mutually independent services
    ///
    /// Every service in a batch depends only on services in earlier batches.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.dependencies.get(n).map_or(0, BTreeSet::len)))
            .collect();

        let mut levels = Vec::new();
        let mut current: Vec<String> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(node, _)| node.to_string())
            .collect();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = BTreeSet::new();
            for node in &current {
                for dependent in self.dependents.get(node).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent.clone());
                        }
                    }
                }
            }
            levels.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }

        if placed != self.nodes.len() {
            let remaining: BTreeSet<&str> = in_degree
                .into_iter()
                .filter(|&(_, degree)| degree > 0)
                .map(|(node, _)| node)
                .collect();
            return Err(Error::DependencyCycle(self.find_cycle(&remaining)));
        }

        Ok(levels)
    }

    /// Reverse of the start order
    pub fn shutdown_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_sort()?;
        order.reverse();
        Ok(order)
    }

    /// Transitive dependencies of `name`, in start order
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.direct_dependencies(name).collect();
        while let Some(dep) = stack.pop() {
            if seen.insert(dep.to_string()) {
                stack.extend(self.direct_dependencies(dep));
            }
        }

        self.topological_sort()
            .unwrap_or_default()
            .into_iter()
            .filter(|n| seen.contains(n))
            .collect()
    }

    /// Services that depend on `name`, directly or transitively
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(node) = stack.pop() {
            for dependent in self.dependents.get(&node).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Get nodes that can run now (all dependencies completed)
    pub fn get_ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| !completed.contains(*node))
            .filter(|node| self.direct_dependencies(node).all(|dep| completed.contains(dep)))
            .cloned()
            .collect()
    }

    /// Walk dependency edges among unplaced nodes until one repeats
    fn find_cycle(&self, remaining: &BTreeSet<&str>) -> Vec<String> {
        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = vec![start];
        loop {
            let Some(&last) = path.last() else {
                return Vec::new();
            };
            let Some(next) = self
                .direct_dependencies(last)
                .find(|dep| remaining.contains(dep))
            else {
                return path.into_iter().map(str::to_string).collect();
            };

            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            path.push(next);
        }
    }
}
