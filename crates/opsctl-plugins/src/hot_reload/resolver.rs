//! Dependency resolver
//!
//! Keeps the `plugin -> depends on` graph and turns a changed plugin into
//! an ordered reload unit: the plugin itself followed by every transitive
//! dependent, each after all of its dependencies.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

use tracing::debug;


/// Resolver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ResolveError {
    #[error("Cyclic dependency among: {}", cycle.join(", "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Plugin {0} is not part of the dependency graph")]
    UnknownPlugin(String),
}

/// Directed dependency graph
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// plugin -> plugins it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
    /// plugin -> plugins that depend on it
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependency set of `plugin`, adding it as a node if needed.
    pub fn set_dependencies<I>(&mut self, plugin: &str, deps: I)
    where
        I: IntoIterator<Item = String>,
    {
        let deps: BTreeSet<String> = deps.into_iter().collect();

        if let Some(old) = self.edges.get(plugin) {
            for dep in old.difference(&deps) {
                if let Some(back) = self.reverse.get_mut(dep) {
                    back.remove(plugin);
                }
            }
        }
        for dep in &deps {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .insert(plugin.to_string());
        }

        debug!(plugin = %plugin, deps = ?deps, "Dependency set updated");
        self.edges.insert(plugin.to_string(), deps);
    }

    /// Drop a plugin node and its outgoing edges. Edges pointing at it from
    /// other plugins stay, so dependents keep reporting it as missing.
    pub fn remove(&mut self, plugin: &str) {
        if let Some(deps) = self.edges.remove(plugin) {
            for dep in deps {
                if let Some(back) = self.reverse.get_mut(&dep) {
                    back.remove(plugin);
                }
            }
        }
    }

    pub fn contains(&self, plugin: &str) -> bool {
        self.edges.contains_key(plugin)
    }

    pub fn dependencies_of(&self, plugin: &str) -> BTreeSet<String> {
        self.edges.get(plugin).cloned().unwrap_or_default()
    }

    /// Direct dependents of `plugin` that are nodes of the graph.
    pub fn dependents_of(&self, plugin: &str) -> BTreeSet<String> {
        self.reverse
            .get(plugin)
            .map(|set| {
                set.iter()
                    .filter(|name| self.edges.contains_key(*name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `plugin` plus every transitive dependent (reverse-edge BFS).
    pub fn dependent_closure(&self, plugin: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::from([plugin.to_string()]);
        let mut queue = VecDeque::from([plugin.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        seen
    }

    /// Ordered reload unit for a change to `changed`.
    pub fn compute_reload_order(&self, changed: &str) -> Result<Vec<String>, ResolveError> {
        if !self.contains(changed) {
            return Err(ResolveError::UnknownPlugin(changed.to_string()));
        }

        let closure = self.dependent_closure(changed);
        let order = self.topological_sort(&closure)?;

        debug!(plugin = %changed, order = ?order, "Computed reload order");
        Ok(order)
    }

    /// Load order for the whole graph (dependencies first).
    pub fn load_order(&self) -> Result<Vec<String>, ResolveError> {
        let all: BTreeSet<String> = self.edges.keys().cloned().collect();
        self.topological_sort(&all)
    }

    /// Whether giving `plugin` the dependency set `deps` would close a cycle.
    pub fn would_cycle(&self, plugin: &str, deps: &BTreeSet<String>) -> bool {
        let mut candidate = self.clone();
        candidate.set_dependencies(plugin, deps.iter().cloned());
        let closure = candidate.dependent_closure(plugin);
        candidate.topological_sort(&closure).is_err()
    }

    /// Kahn's algorithm over the subgraph induced by `nodes`, smallest name
    /// first among ready nodes.
    fn topological_sort(&self, nodes: &BTreeSet<String>) -> Result<Vec<String>, ResolveError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in nodes {
            let deps_inside = self
                .edges
                .get(node)
                .map(|deps| deps.iter().filter(|d| nodes.contains(*d)).count())
                .unwrap_or(0);
            in_degree.insert(node.as_str(), deps_inside);
        }

        let mut ready: BinaryHeap<Reverse<&str>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| Reverse(*name))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse(name)) = ready.pop() {
            order.push(name.to_string());

            if let Some(dependents) = self.reverse.get(name) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push(Reverse(dependent.as_str()));
                        }
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            let cycle = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return Err(ResolveError::CyclicDependency { cycle });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (plugin, deps) in edges {
            g.set_dependencies(plugin, deps.iter().map(|d| d.to_string()));
        }
        g
    }

    #[test]
    fn test_dependent_follows_dependency() {
        let g = graph(&[("database", &[]), ("billing", &["database"])]);

        assert_eq!(
            g.compute_reload_order("database").unwrap(),
            vec!["database", "billing"]
        );
        assert_eq!(g.compute_reload_order("billing").unwrap(), vec!["billing"]);
    }

    #[test]
    fn test_diamond_orders_every_dependent_after_its_dependencies() {
        // core <- (auth, storage) <- api ; metrics unrelated
        let g = graph(&[
            ("core", &[]),
            ("auth", &["core"]),
            ("storage", &["core"]),
            ("api", &["auth", "storage"]),
            ("metrics", &[]),
        ]);

        let order = g.compute_reload_order("core").unwrap();
        assert_eq!(order, vec!["core", "auth", "storage", "api"]);

        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("auth") < pos("api"));
        assert!(pos("storage") < pos("api"));
        assert!(!order.contains(&"metrics".to_string()));
    }

    #[test]
    fn test_transitive_dependents_only_depend_on_unit_members_through_changed() {
        // report depends on billing (in unit) and on ledger (outside unit)
        let g = graph(&[
            ("database", &[]),
            ("ledger", &[]),
            ("billing", &["database"]),
            ("report", &["billing", "ledger"]),
        ]);

        assert_eq!(
            g.compute_reload_order("database").unwrap(),
            vec!["database", "billing", "report"]
        );
    }

    #[test]
    fn test_cycle_through_changed_plugin_is_rejected() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);

        let err = g.compute_reload_order("a").unwrap_err();
        assert_eq!(
            err,
            ResolveError::CyclicDependency {
                cycle: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
        assert!(g.load_order().is_err());
    }

    #[test]
    fn test_cycle_outside_the_unit_does_not_block_it() {
        let g = graph(&[("x", &["y"]), ("y", &["x"]), ("solo", &[])]);
        assert_eq!(g.compute_reload_order("solo").unwrap(), vec!["solo"]);
    }

    #[test]
    fn test_unknown_plugin() {
        let g = graph(&[("a", &[])]);
        assert_eq!(
            g.compute_reload_order("ghost"),
            Err(ResolveError::UnknownPlugin("ghost".to_string()))
        );
    }

    #[test]
    fn test_set_dependencies_rebuilds_reverse_edges() {
        let mut g = graph(&[("database", &[]), ("cache", &[]), ("billing", &["database"])]);

        g.set_dependencies("billing", ["cache".to_string()]);
        assert!(g.dependents_of("database").is_empty());
        assert_eq!(
            g.compute_reload_order("cache").unwrap(),
            vec!["cache", "billing"]
        );

        g.remove("billing");
        assert_eq!(g.compute_reload_order("cache").unwrap(), vec!["cache"]);
    }

    #[test]
    fn test_load_order_and_would_cycle() {
        let g = graph(&[("gateway", &["cluster"]), ("cluster", &[]), ("charts", &["cluster"])]);

        assert_eq!(g.load_order().unwrap(), vec!["cluster", "charts", "gateway"]);
        assert!(g.would_cycle("cluster", &BTreeSet::from(["gateway".to_string()])));
        assert!(!g.would_cycle("charts", &BTreeSet::from(["gateway".to_string()])));
    }
}
