//! List command implementation.

use console::style;
use miette::{IntoDiagnostic, Result};
use palisade_engine::{RuntimeConfig, discover};

use crate::output;

/// Lists discovered plugins and the directories that were skipped.
pub fn execute(config: &RuntimeConfig, detailed: bool) -> Result<()> {
    let discovery = discover(&config.plugin_root).into_diagnostic()?;

    println!(
        "{} {}",
        style("Plugins in").bold(),
        style(config.plugin_root.display()).bold()
    );
    println!();

    for manifest in &discovery.manifests {
        if detailed {
            println!("  {}", style(&manifest.name).cyan().bold());
            if let Some(desc) = &manifest.description {
                println!("    {}", style(desc).dim());
            }
            println!("    Version: {}", manifest.version);
            println!("    Mode: {}", manifest.execution_mode);
            println!("    Entry point: {}", style(&manifest.entry_point).dim());
            if !manifest.requires.is_empty() {
                println!(
                    "    Requires: {}",
                    style(manifest.requires.join(", ")).dim()
                );
            }
            println!(
                "    Timeout: {}s, rate: {}/{}s",
                manifest.resources.timeout_seconds,
                manifest.resources.rate_limit.calls,
                manifest.resources.rate_limit.period_seconds
            );
            println!();
        } else {
            print!(
                "  {} {} {}",
                manifest.name,
                style(&manifest.version).dim(),
                style(format!("[{}]", manifest.execution_mode)).yellow()
            );
            if !manifest.requires.is_empty() {
                print!(" - requires {}", style(manifest.requires.join(", ")).dim());
            }
            println!();
        }
    }

    if !discovery.skipped.is_empty() {
        println!();
        for (dir, reason) in &discovery.skipped {
            output::plugin_skipped(dir, reason);
        }
    }

    Ok(())
}
