//! Validate command implementation.

use miette::{IntoDiagnostic, Result, miette};
use palisade_engine::{DependencyGraph, RuntimeConfig, discover};

use crate::output;

/// Validates every manifest and the dependency graph.
pub fn execute(config: &RuntimeConfig) -> Result<()> {
    output::info(&format!("Validating {}...", config.plugin_root.display()));

    let discovery = discover(&config.plugin_root).into_diagnostic()?;
    let mut problems = 0;

    for (dir, reason) in &discovery.skipped {
        output::plugin_failed(dir, reason);
        problems += 1;
    }

    let graph = DependencyGraph::from_manifests(&discovery.manifests);
    for (name, absent) in graph.missing() {
        output::error(&format!(
            "Plugin '{}' requires undefined plugin(s): {}",
            name,
            absent.join(", ")
        ));
        problems += 1;
    }

    if let Err(e) = graph.levels() {
        output::error(&format!("Dependency error: {}", e));
        problems += 1;
    }

    if problems > 0 {
        return Err(miette!("Validation failed: {} problem(s)", problems));
    }

    output::success(&format!(
        "All plugins are valid ({} plugins)",
        discovery.manifests.len()
    ));

    Ok(())
}
