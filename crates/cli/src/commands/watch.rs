//! Watch command implementation.
//!
//! Boots the runtime and hot-reloads plugins whose files change.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use console::style;
use miette::{IntoDiagnostic, Result, miette};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use palisade_core::PluginManifest;
use palisade_engine::{RuntimeConfig, Supervisor, discover};
use palisade_security::SIGNATURE_FILE;
use tokio::sync::mpsc;

use super::run::boot;
use crate::output;

/// Executes watch mode.
pub async fn execute(config: RuntimeConfig, debounce_ms: u64) -> Result<()> {
    let root = config.plugin_root.clone();
    let (supervisor, _) = boot(config, false).await?;

    let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.blocking_send(path);
                }
            }
        },
        Config::default().with_poll_interval(Duration::from_millis(200)),
    )
    .map_err(|e| miette!("Failed to create file watcher: {}", e))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| miette!("Failed to watch {}: {}", root.display(), e))?;

    println!(
        "\n{} Watching {} for changes...\n",
        style("👁").cyan(),
        style(root.display()).cyan().bold()
    );

    let debounce = Duration::from_millis(debounce_ms);
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let idle = pending.is_empty();
        let quiet_period = async move {
            if idle {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(debounce).await;
            }
        };

        tokio::select! {
            changed = rx.recv() => match changed {
                Some(path) => {
                    pending.insert(path);
                }
                None => break,
            },
            () = quiet_period => {
                let changed = std::mem::take(&mut pending);
                apply_changes(&supervisor, &root, changed).await;
            }
            signal = &mut ctrl_c => {
                signal.into_diagnostic()?;
                break;
            }
        }
    }

    supervisor.shutdown().await;
    output::success("All plugins unloaded");
    Ok(())
}

/// Reloads (or first loads) every plugin touched by `changed`.
async fn apply_changes(supervisor: &Supervisor, root: &Path, changed: BTreeSet<PathBuf>) {
    let manifests = match discover(root) {
        Ok(discovery) => {
            for (dir, reason) in &discovery.skipped {
                output::plugin_skipped(dir, reason);
            }
            discovery.manifests
        }
        Err(e) => {
            output::error(&format!("Failed to scan plugin root: {}", e));
            return;
        }
    };

    let plugins = affected_plugins(&manifests, &changed);
    let loaded = supervisor.loaded();

    for name in plugins {
        let start = Instant::now();
        println!("\n{} {} changed", style("↻").yellow().bold(), style(&name).yellow());

        let result = if loaded.contains(&name) {
            supervisor.reload(&name).await
        } else {
            supervisor.load(&name).await.map(|_| ())
        };

        match result {
            Ok(()) => output::success(&format!(
                "{} reloaded in {}ms",
                name,
                start.elapsed().as_millis()
            )),
            Err(e) => output::plugin_failed(&name, &e.to_string()),
        }
    }
}

/// Names of the plugins whose directory holds any of `changed`.
///
/// Signature files are written by `palisade sign` and never trigger a reload.
fn affected_plugins(manifests: &[PluginManifest], changed: &BTreeSet<PathBuf>) -> BTreeSet<String> {
    changed
        .iter()
        .filter(|path| path.file_name().is_none_or(|f| f != SIGNATURE_FILE))
        .filter_map(|path| {
            manifests
                .iter()
                .filter(|m| path.starts_with(&m.directory))
                .max_by_key(|m| m.directory.components().count())
                .map(|m| m.name.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_parser::{ManifestFormat, parse_manifest_str};

    fn manifest(name: &str, dir: &str) -> PluginManifest {
        parse_manifest_str(
            &format!(r#"{{"name": "{name}", "version": "1", "entry_point": "main.py"}}"#),
            ManifestFormat::Json,
            Path::new(dir),
        )
        .unwrap()
    }

    #[test]
    fn test_affected_plugins_by_directory() {
        let manifests = vec![
            manifest("auth", "/plugins/auth"),
            manifest("core", "/plugins/core"),
        ];
        let changed: BTreeSet<PathBuf> = [
            "/plugins/auth/src/main.py",
            "/plugins/auth/plugin.yaml",
            "/plugins/core/plugin.sig",
            "/plugins/README.md",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        let affected = affected_plugins(&manifests, &changed);
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["auth"]);
    }

    #[test]
    fn test_sibling_prefix_is_not_a_match() {
        let manifests = vec![manifest("core", "/plugins/core")];
        let changed: BTreeSet<PathBuf> = [PathBuf::from("/plugins/core-extra/main.py")].into();
        assert!(affected_plugins(&manifests, &changed).is_empty());
    }
}
