//! Plugin root and plugin discovery logic.

use std::path::{Path, PathBuf};

use miette::{IntoDiagnostic, Result, miette};
use palisade_core::PluginManifest;
use palisade_engine::{RuntimeConfig, discover};
use palisade_parser::{find_manifest, load_manifest};

/// Default plugin root directory name.
const PLUGIN_ROOT_NAME: &str = "plugins";

/// Finds the plugin root by searching from the current directory upwards.
pub fn find_plugin_root() -> Result<PathBuf> {
    find_plugin_root_from(
        &std::env::current_dir().map_err(|e| miette!("Cannot get current directory: {}", e))?,
    )
}

/// Finds the plugin root starting from the given directory.
pub fn find_plugin_root_from(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let root = current.join(PLUGIN_ROOT_NAME);

        if root.is_dir() {
            return Ok(root);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                return Err(miette!(
                    "No '{}' directory found in {} or any parent directory",
                    PLUGIN_ROOT_NAME,
                    start.display()
                ));
            }
        }
    }
}

/// Resolves a plugin given by name or by directory.
pub fn resolve_plugin(config: &RuntimeConfig, plugin: &str) -> Result<PluginManifest> {
    let path = Path::new(plugin);
    if path.is_dir() && find_manifest(path).is_some() {
        return load_manifest(path).into_diagnostic();
    }

    let discovery = discover(&config.plugin_root).into_diagnostic()?;
    discovery
        .manifests
        .into_iter()
        .find(|m| m.name == plugin)
        .ok_or_else(|| {
            miette!(
                "Plugin '{}' not found under {}",
                plugin,
                config.plugin_root.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_plugin(root: &Path, dir: &str, name: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join("plugin.yaml"),
            format!("name: {name}\nversion: '1'\nentry_point: main.py\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_find_plugin_root_in_current() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("plugins")).unwrap();

        let result = find_plugin_root_from(dir.path()).unwrap();
        assert_eq!(result, dir.path().join("plugins"));
    }

    #[test]
    fn test_find_plugin_root_in_parent() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("plugins")).unwrap();

        let subdir = dir.path().join("app").join("src");
        fs::create_dir_all(&subdir).unwrap();

        let result = find_plugin_root_from(&subdir).unwrap();
        assert_eq!(result, dir.path().join("plugins"));
    }

    #[test]
    fn test_resolve_by_name_and_directory() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "auth-dir", "auth");
        let config = RuntimeConfig::new(dir.path());

        let by_name = resolve_plugin(&config, "auth").unwrap();
        assert_eq!(by_name.name, "auth");

        let by_dir = resolve_plugin(&config, dir.path().join("auth-dir").to_str().unwrap()).unwrap();
        assert_eq!(by_dir.name, "auth");

        assert!(resolve_plugin(&config, "ghost").is_err());
    }
}
