//! Scan command implementation.

use console::style;
use miette::{Result, miette};
use palisade_core::ExecutionMode;
use palisade_engine::RuntimeConfig;
use palisade_security::{Finding, Scanner};

use crate::discovery;
use crate::output;

/// Runs the static import scanner over one plugin's sources.
pub fn execute(config: &RuntimeConfig, plugin: &str) -> Result<()> {
    let manifest = discovery::resolve_plugin(config, plugin)?;
    let report = Scanner::new().scan_plugin(&manifest);

    output::info(&format!(
        "Scanned {} file(s) of '{}' ({})",
        report.files_scanned, manifest.name, manifest.execution_mode
    ));

    for finding in &report.errors {
        print_finding(finding, true);
    }
    for finding in &report.warnings {
        print_finding(finding, false);
    }

    if report.passed() {
        output::success("No blocking findings");
        return Ok(());
    }

    if manifest.execution_mode == ExecutionMode::Sandboxed {
        Err(miette!(
            "Scan failed: {} blocking finding(s)",
            report.errors.len()
        ))
    } else {
        output::warning("Findings are advisory for in-process plugins");
        Ok(())
    }
}

fn print_finding(finding: &Finding, blocking: bool) {
    let marker = if blocking {
        style("✗").red()
    } else {
        style("⚠").yellow()
    };
    println!("  {} {}", marker, finding);
}
