//! Graph command implementation.

use console::style;
use miette::{IntoDiagnostic, Result, miette};
use palisade_engine::{DependencyGraph, RuntimeConfig, Scheduler, discover};

/// Shows the dependency graph and its load waves.
pub fn execute(config: &RuntimeConfig, format: &str) -> Result<()> {
    let discovery = discover(&config.plugin_root).into_diagnostic()?;
    let graph = DependencyGraph::from_manifests(&discovery.manifests);

    match format {
        "ascii" => print_ascii(graph),
        "dot" => {
            print!("{}", graph.to_dot());
            Ok(())
        }
        _ => Err(miette!("Unknown format: {}. Use 'ascii' or 'dot'", format)),
    }
}

/// Prints each plugin with its direct requirements, then the wave plan.
fn print_ascii(graph: DependencyGraph) -> Result<()> {
    println!("Dependency Graph:");
    println!();

    for name in graph.plugin_names() {
        println!("● {}", name);
        for dep in graph.dependencies_of(name) {
            println!("  └─ {}", dep);
        }
    }
    for (name, absent) in graph.missing() {
        for dep in absent {
            println!(
                "{} {} requires missing {}",
                style("✗").red(),
                name,
                style(dep).red()
            );
        }
    }

    let total = graph.plugin_names().len();
    let mut scheduler = Scheduler::new(graph).into_diagnostic()?;
    scheduler.fail_missing();
    let (waves, blocked) = scheduler.preview();

    println!();
    println!("Load Plan ({} plugins):", total - blocked.len());
    for wave in &waves {
        let marker = if wave.is_parallel() { "parallel" } else { "serial" };
        println!(
            "  Wave {}: {} {}",
            wave.number,
            wave.plugins.join(", "),
            style(format!("({marker})")).dim()
        );
    }
    for (name, reason) in &blocked {
        println!("  {} {} {}", style("✗").red(), name, style(format!("({reason})")).dim());
    }

    Ok(())
}
