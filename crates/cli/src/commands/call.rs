//! Call command implementation.

use miette::{IntoDiagnostic, Result, WrapErr, miette};
use palisade_engine::RuntimeConfig;
use serde_json::Value;

use super::run::boot;

/// Boots the runtime, performs one call and prints the response.
pub async fn execute(config: RuntimeConfig, plugin: &str, action: &str, payload: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(payload)
        .into_diagnostic()
        .wrap_err("Payload is not valid JSON")?;

    let (supervisor, _) = boot(config, true).await?;
    let response = supervisor.call(plugin, action, payload).await;
    supervisor.shutdown().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&response).into_diagnostic()?
    );

    if response["status"] == "error" {
        return Err(miette!(
            "Call failed: {}",
            response["code"].as_str().unwrap_or("error")
        ));
    }
    Ok(())
}
