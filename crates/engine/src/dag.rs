//! Directed Acyclic Graph for plugin dependency resolution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use palisade_core::{PalisadeError, PluginManifest, Result};
use petgraph::Direction;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};

/// Dependency graph of the plugins in one load set.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Mapping from plugin name to node index.
    nodes: BTreeMap<String, NodeIndex>,

    /// Edges go from a dependency to its dependent.
    graph: DiGraph<String, ()>,

    /// Requirements naming plugins outside the load set.
    missing: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Builds the graph from manifests. Unknown requirements are recorded,
    /// not rejected.
    pub fn from_manifests<'a>(manifests: impl IntoIterator<Item = &'a PluginManifest>) -> Self {
        let manifests: Vec<&PluginManifest> = manifests.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut nodes = BTreeMap::new();

        for manifest in &manifests {
            let idx = graph.add_node(manifest.name.clone());
            nodes.insert(manifest.name.clone(), idx);
        }

        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for manifest in &manifests {
            let to = nodes[&manifest.name];
            for dep in &manifest.requires {
                match nodes.get(dep) {
                    Some(from) => {
                        graph.update_edge(*from, to, ());
                    }
                    None => missing
                        .entry(manifest.name.clone())
                        .or_default()
                        .push(dep.clone()),
                }
            }
        }

        Self {
            nodes,
            graph,
            missing,
        }
    }

    /// Plugins whose requirements are absent, with the absent names.
    pub fn missing(&self) -> &BTreeMap<String, Vec<String>> {
        &self.missing
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Plugin names in alphabetical order.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Direct dependencies of `name` that are part of the graph.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Every plugin that depends on `name`, directly or transitively.
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self
            .neighbors(name, Direction::Outgoing)
            .into_iter()
            .collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.neighbors(&next, Direction::Outgoing));
            }
        }
        seen
    }

    fn neighbors(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        self.nodes
            .get(name)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, direction)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deterministic topological order (Kahn's algorithm, alphabetical
    /// tie-breaking). A cycle fails with every plugin that could not be placed.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Plugins grouped into waves. A wave holds every plugin whose
    /// dependencies all sit in earlier waves.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, idx)| {
                let degree = self
                    .graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .count();
                (name.as_str(), degree)
            })
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let level: Vec<&str> = std::mem::take(&mut ready).into_iter().collect();
            for name in &level {
                in_degree.remove(name);
                let idx = self.nodes[*name];
                for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    let dependent = self.graph[dependent].as_str();
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
            placed += level.len();
            levels.push(level.into_iter().map(str::to_string).collect());
        }

        if placed < self.nodes.len() {
            return Err(PalisadeError::CycleDetected {
                stuck: in_degree.keys().map(|n| n.to_string()).collect(),
            });
        }

        Ok(levels)
    }

    /// `target` preceded by everything it needs, in load order.
    pub fn load_order_for(&self, target: &str) -> Result<Vec<String>> {
        if !self.contains(target) {
            return Err(PalisadeError::PluginNotFound(target.to_string()));
        }

        let mut required = BTreeSet::new();
        let mut queue = VecDeque::from([target.to_string()]);
        while let Some(next) = queue.pop_front() {
            if let Some(absent) = self.missing.get(&next) {
                return Err(PalisadeError::Load {
                    plugin: next.clone(),
                    message: format!("requires missing plugin(s): {}", absent.join(", ")),
                });
            }
            if required.insert(next.clone()) {
                queue.extend(self.dependencies_of(&next));
            }
        }

        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|name| required.contains(name))
            .collect())
    }

    /// Graphviz rendering, edges pointing from dependency to dependent.
    pub fn to_dot(&self) -> String {
        format!("{:?}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::ExecutionMode;
    use palisade_parser::parse_manifest_str;
    use palisade_parser::ManifestFormat;
    use std::path::Path;

    fn manifest(name: &str, requires: &[&str]) -> PluginManifest {
        let requires: Vec<String> = requires.iter().map(|r| format!("\"{r}\"")).collect();
        let json = format!(
            r#"{{"name": "{name}", "version": "1.0", "execution_mode": "trusted",
                "entry_point": "lib.so", "requires": [{}]}}"#,
            requires.join(", ")
        );
        let manifest =
            parse_manifest_str(&json, ManifestFormat::Json, Path::new("/plugins")).unwrap();
        assert_eq!(manifest.execution_mode, ExecutionMode::Trusted);
        manifest
    }

    #[test]
    fn test_levels_are_deterministic() {
        let manifests = vec![
            manifest("web", &["auth", "core"]),
            manifest("auth", &["core"]),
            manifest("metrics", &[]),
            manifest("core", &[]),
        ];
        let dag = DependencyGraph::from_manifests(&manifests);

        let levels = dag.levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["core".to_string(), "metrics".to_string()],
                vec!["auth".to_string()],
                vec!["web".to_string()],
            ]
        );
        assert_eq!(
            dag.topological_order().unwrap(),
            vec!["core", "metrics", "auth", "web"]
        );
    }

    #[test]
    fn test_cycle_names_stuck_set() {
        let manifests = vec![
            manifest("a", &["c"]),
            manifest("b", &["a"]),
            manifest("c", &["b"]),
            manifest("d", &["a"]),
            manifest("free", &[]),
        ];
        let dag = DependencyGraph::from_manifests(&manifests);

        match dag.levels() {
            Err(PalisadeError::CycleDetected { stuck }) => {
                assert_eq!(stuck, vec!["a", "b", "c", "d"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_and_dependents() {
        let manifests = vec![
            manifest("core", &[]),
            manifest("auth", &["core", "ghost"]),
            manifest("web", &["auth"]),
        ];
        let dag = DependencyGraph::from_manifests(&manifests);

        assert_eq!(dag.missing()["auth"], vec!["ghost".to_string()]);
        assert_eq!(
            dag.dependents_of("core"),
            BTreeSet::from(["auth".to_string(), "web".to_string()])
        );
        assert!(dag.dependents_of("web").is_empty());
        assert!(dag.load_order_for("web").is_err());
    }

    #[test]
    fn test_load_order_for_target() {
        let manifests = vec![
            manifest("core", &[]),
            manifest("auth", &["core"]),
            manifest("web", &["auth"]),
            manifest("other", &[]),
        ];
        let dag = DependencyGraph::from_manifests(&manifests);

        assert_eq!(dag.load_order_for("web").unwrap(), vec!["core", "auth", "web"]);
        assert!(matches!(
            dag.load_order_for("nope"),
            Err(PalisadeError::PluginNotFound(_))
        ));
        assert!(dag.to_dot().contains("digraph"));
    }
}
