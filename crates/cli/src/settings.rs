//! Maps command-line options onto the runtime configuration.

use miette::{IntoDiagnostic, Result, WrapErr, miette};
use palisade_engine::{RuntimeConfig, WorkerCommand};
use palisade_security::SigningKey;
use tracing::debug;

use crate::GlobalArgs;
use crate::discovery;

/// Builds the runtime configuration. Flags override the config file.
pub fn runtime_config(args: &GlobalArgs) -> Result<RuntimeConfig> {
    let root = match &args.root {
        Some(root) => root.clone(),
        None => discovery::find_plugin_root()?,
    };

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read config {}", path.display()))?,
        None => RuntimeConfig::discover(&root).into_diagnostic()?,
    };
    config.plugin_root = root;

    if let Some(line) = &args.worker {
        let worker = WorkerCommand::parse(line)
            .ok_or_else(|| miette!("Worker command must not be empty"))?;
        config = config.with_worker(worker);
    }

    if let Some(key) = signing_key(args)? {
        config = config.with_signing_key(key);
    }

    if args.strict_trust {
        config = config.with_strict_trust(true);
    }

    debug!(
        root = %config.plugin_root.display(),
        worker = %config.worker.program,
        strict_trust = config.strict_trust,
        "runtime configured"
    );
    Ok(config)
}

fn signing_key(args: &GlobalArgs) -> Result<Option<SigningKey>> {
    if let Some(secret) = &args.signing_key {
        return Ok(Some(SigningKey::derive(secret.as_bytes())));
    }
    match &args.signing_key_file {
        Some(path) => SigningKey::from_file(path)
            .map(Some)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read signing key {}", path.display())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("palisade.json"),
            r#"{"strict_trust": false, "max_response_bytes": 2048}"#,
        )
        .unwrap();

        let args = GlobalArgs {
            root: Some(dir.path().to_path_buf()),
            worker: Some("node worker.js --fast".to_string()),
            signing_key: Some("secret".to_string()),
            strict_trust: true,
            ..GlobalArgs::default()
        };
        let config = runtime_config(&args).unwrap();

        assert_eq!(config.plugin_root, dir.path());
        assert_eq!(config.max_response_bytes, 2048);
        assert!(config.strict_trust);
        assert_eq!(config.worker.program, "node");
        assert_eq!(config.worker.args, vec!["worker.js", "--fast"]);
        assert!(config.signing_key.is_some());
    }

    #[test]
    fn test_empty_worker_is_rejected() {
        let dir = tempdir().unwrap();
        let args = GlobalArgs {
            root: Some(dir.path().to_path_buf()),
            worker: Some("   ".to_string()),
            ..GlobalArgs::default()
        };
        assert!(runtime_config(&args).is_err());
    }
}
