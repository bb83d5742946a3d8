//! Wave-by-wave activation with failure cascading.
//!
//! The scheduler hands out waves of plugins whose requirements are all
//! active. A failed plugin takes everything that depends on it, directly or
//! transitively, down with it, and those plugins are never handed out.

use std::collections::{BTreeMap, BTreeSet};

use palisade_core::Result;

use crate::dag::DependencyGraph;

/// Tracks which plugins are active, failed or still pending during a load.
#[derive(Debug)]
pub struct Scheduler {
    graph: DependencyGraph,
    levels: Vec<Vec<String>>,
    cursor: usize,
    waves_issued: usize,
    active: BTreeSet<String>,
    failed: BTreeMap<String, String>,
    max_parallelism: usize,
}

/// Plugins to activate together. None of them depends on another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    /// One-based position among the waves handed out.
    pub number: usize,
    pub plugins: Vec<String>,
}

impl Wave {
    pub fn is_parallel(&self) -> bool {
        self.plugins.len() > 1
    }
}

impl Scheduler {
    /// Fails on a dependency cycle, before anything is handed out.
    pub fn new(graph: DependencyGraph) -> Result<Self> {
        let levels = graph.levels()?;
        Ok(Self {
            graph,
            levels,
            cursor: 0,
            waves_issued: 0,
            active: BTreeSet::new(),
            failed: BTreeMap::new(),
            max_parallelism: num_cpus::get(),
        })
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max.max(1);
        self
    }

    /// Plugins already running before this load. They are skipped and never
    /// cascaded into failure.
    pub fn with_active(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.active.extend(names);
        self
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Fails every plugin requiring an absent plugin, and its dependents.
    pub fn fail_missing(&mut self) -> Vec<(String, String)> {
        let missing: Vec<(String, Vec<String>)> = self
            .graph
            .missing()
            .iter()
            .map(|(name, absent)| (name.clone(), absent.clone()))
            .collect();

        missing
            .into_iter()
            .flat_map(|(name, absent)| {
                let reason = format!("requires missing plugin(s): {}", absent.join(", "));
                self.fail(&name, reason)
            })
            .collect()
    }

    /// Next group of plugins ready to activate, or `None` when done.
    pub fn next_wave(&mut self) -> Option<Wave> {
        while let Some(level) = self.levels.get(self.cursor) {
            self.cursor += 1;
            let plugins: Vec<String> = level
                .iter()
                .filter(|name| !self.active.contains(*name) && !self.failed.contains_key(*name))
                .cloned()
                .collect();
            if plugins.is_empty() {
                continue;
            }
            self.waves_issued += 1;
            return Some(Wave {
                number: self.waves_issued,
                plugins,
            });
        }
        None
    }

    pub fn mark_active(&mut self, name: &str) {
        self.active.insert(name.to_string());
    }

    /// Records `name` as failed and cascades to its dependents.
    ///
    /// Returns the newly failed plugins with their reasons, `name` first.
    pub fn fail(&mut self, name: &str, reason: String) -> Vec<(String, String)> {
        let mut newly_failed = Vec::new();
        if self.failed.contains_key(name) {
            return newly_failed;
        }
        self.failed.insert(name.to_string(), reason.clone());
        newly_failed.push((name.to_string(), reason));

        for dependent in self.graph.dependents_of(name) {
            if self.failed.contains_key(&dependent) || self.active.contains(&dependent) {
                continue;
            }
            let reason = format!("dependency '{name}' failed");
            self.failed.insert(dependent.clone(), reason.clone());
            newly_failed.push((dependent, reason));
        }
        newly_failed
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.failed.contains_key(name)
    }

    /// Waves a load would run if nothing failed at activation time.
    pub fn preview(mut self) -> (Vec<Wave>, BTreeMap<String, String>) {
        let mut waves = Vec::new();
        while let Some(wave) = self.next_wave() {
            for name in &wave.plugins {
                self.mark_active(name);
            }
            waves.push(wave);
        }
        (waves, self.failed)
    }

    /// Failed plugins and their reasons, by name.
    pub fn into_failures(self) -> BTreeMap<String, String> {
        self.failed
    }
}
