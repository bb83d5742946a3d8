//! Worker process construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use palisade_core::{PalisadeError, PluginManifest, Result};
use palisade_plugin::protocol::MAX_MEMORY_ENV;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::WorkerCommand;

/// Resolves the worker program against the host `PATH`.
///
/// Programs given as a path are used as is.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if Path::new(program).components().count() > 1 {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| PalisadeError::Load {
        plugin: String::new(),
        message: format!("worker program '{program}' not found: {e}"),
    })
}

/// Environment of a worker: selected host variables, then the manifest's
/// resolved `env`, then the runtime hints.
pub fn worker_env(manifest: &PluginManifest, inherited: &[String]) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
        .collect();
    env.extend(manifest.env.clone());
    env.insert("PALISADE_PLUGIN_NAME".to_string(), manifest.name.clone());
    env.insert(
        MAX_MEMORY_ENV.to_string(),
        manifest.resources.max_memory_mb.to_string(),
    );
    env
}

/// Starts the worker for `manifest` with piped stdio.
///
/// The child is killed when its handle is dropped.
pub fn spawn_worker(
    manifest: &PluginManifest,
    worker: &WorkerCommand,
    inherited: &[String],
) -> Result<Child> {
    let program = resolve_program(&worker.program).map_err(|e| PalisadeError::Load {
        plugin: manifest.name.clone(),
        message: e.to_string(),
    })?;

    let mut command = Command::new(&program);
    command
        .args(&worker.args)
        .arg(&manifest.directory)
        .current_dir(&manifest.directory)
        .env_clear()
        .envs(worker_env(manifest, inherited))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| PalisadeError::Load {
        plugin: manifest.name.clone(),
        message: format!("failed to spawn {}: {e}", program.display()),
    })?;

    debug!(plugin = %manifest.name, pid = ?child.id(), program = %program.display(), "spawned worker");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_parser::{ManifestFormat, parse_manifest_str};

    fn manifest(dir: &Path) -> PluginManifest {
        parse_manifest_str(
            r#"{"name": "echo", "version": "1", "entry_point": "main.py",
                "env": {"GREETING": "hi"}, "resources": {"max_memory_mb": 64}}"#,
            ManifestFormat::Json,
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_worker_env_is_minimal() {
        let env = worker_env(&manifest(Path::new("/tmp")), &["PATH".to_string()]);
        assert_eq!(env["GREETING"], "hi");
        assert_eq!(env["PALISADE_PLUGIN_NAME"], "echo");
        assert_eq!(env["PALISADE_MAX_MEMORY_MB"], "64");
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(
            resolve_program("/bin/sh").unwrap(),
            PathBuf::from("/bin/sh")
        );
        assert!(resolve_program("definitely-not-a-real-program-xyz").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_runs_in_plugin_dir() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::TempDir::new().unwrap();
        let manifest = manifest(dir.path());
        let worker = WorkerCommand::new("/bin/sh")
            .with_arg("-c")
            .with_arg("echo \"$PALISADE_PLUGIN_NAME $GREETING $(pwd)\"")
            .with_arg("worker");

        let mut child = spawn_worker(&manifest, &worker, &["PATH".to_string()]).unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        child.wait().await.unwrap();

        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(out.trim(), format!("echo hi {}", cwd.display()));
    }
}
