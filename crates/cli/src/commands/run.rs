//! Run command implementation.

use std::time::Instant;

use miette::{IntoDiagnostic, Result, miette};
use palisade_engine::{LoadReport, RuntimeConfig, Supervisor};

use crate::output;

/// Builds a supervisor and activates every plugin.
pub async fn boot(config: RuntimeConfig, quiet: bool) -> Result<(Supervisor, LoadReport)> {
    let start = Instant::now();
    let supervisor = Supervisor::builder(config).build();

    let spinner = (!quiet).then(|| output::create_spinner("Loading plugins..."));
    let result = supervisor.boot().await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let report = result.map_err(|e| miette!("Boot failed: {}", e))?;
    if !quiet {
        output::load_summary(&report, start.elapsed().as_millis() as u64);
    }
    Ok((supervisor, report))
}

/// Boots every plugin and keeps them supervised until Ctrl-C.
pub async fn execute(config: RuntimeConfig) -> Result<()> {
    let (supervisor, _) = boot(config, false).await?;
    output::status_table(&supervisor.status().await);

    println!();
    output::info("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.into_diagnostic()?;

    let spinner = output::create_spinner("Shutting down...");
    supervisor.shutdown().await;
    spinner.finish_and_clear();
    output::success("All plugins unloaded");

    Ok(())
}
