//! Manifest discovery, default overlay and validation.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use palisade_core::interpolation::interpolate_map;
use palisade_core::{
    ExecutionMode, InterpolationContext, ManifestDefaults, PalisadeError, PluginManifest, Result,
};

use crate::envfile::{ENV_FILE, parse_env_file};

/// Manifest file names, in lookup order.
pub const MANIFEST_FILES: [&str; 3] = ["plugin.yaml", "plugin.yml", "plugin.json"];

/// Serialization format of a manifest file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
}

impl ManifestFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Returns the manifest file of `dir`, if any.
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Reads and validates the manifest in `dir`.
pub fn load_manifest(dir: &Path) -> Result<PluginManifest> {
    let path = find_manifest(dir).ok_or_else(|| {
        invalid(
            &directory_label(dir),
            format!(
                "no {} found in {}",
                MANIFEST_FILES.join(", "),
                dir.display()
            ),
        )
    })?;

    let content = std::fs::read_to_string(&path).map_err(|source| PalisadeError::FileRead {
        path: path.clone(),
        source,
    })?;

    debug!(path = %path.display(), "parsing manifest");
    parse_manifest_str(&content, ManifestFormat::from_path(&path), dir)
}

/// Parses manifest content belonging to the plugin directory `dir`.
///
/// The document is deep-merged onto the defaults of its execution mode, so
/// explicit values always win.
pub fn parse_manifest_str(
    content: &str,
    format: ManifestFormat,
    dir: &Path,
) -> Result<PluginManifest> {
    let label = directory_label(dir);

    let document: Value = match format {
        ManifestFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| invalid(&label, format!("invalid YAML: {e}")))?,
        ManifestFormat::Json => serde_json::from_str(content)
            .map_err(|e| invalid(&label, format!("invalid JSON: {e}")))?,
    };

    let Value::Object(mut fields) = document else {
        return Err(invalid(&label, "manifest must be a mapping"));
    };

    let name = required_string(&mut fields, "name", &label)?;
    required_string(&mut fields, "version", &name)?;

    let mode = match fields.get("execution_mode") {
        None | Some(Value::Null) => ExecutionMode::Sandboxed,
        Some(Value::String(s)) => s.parse().map_err(|m: String| invalid(&name, m))?,
        Some(_) => return Err(invalid(&name, "execution_mode must be a string")),
    };
    fields.insert(
        "execution_mode".to_string(),
        Value::String(mode.as_str().to_string()),
    );

    if let Some(Value::Object(env)) = fields.get_mut("env") {
        stringify_scalars(env);
    }

    let mut merged = serde_json::to_value(ManifestDefaults::for_mode(mode))?;
    deep_merge(&mut merged, Value::Object(fields));

    let mut manifest: PluginManifest =
        serde_json::from_value(merged).map_err(|e| invalid(&name, e.to_string()))?;
    manifest.directory = dir.to_path_buf();

    validate(&mut manifest)?;
    resolve_env(&mut manifest)?;

    Ok(manifest)
}

/// Recursively overlays `overlay` onto `base`. Null overlay values keep the base.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

fn validate(manifest: &mut PluginManifest) -> Result<()> {
    let name = manifest.name.clone();

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(
            &name,
            "name may only contain letters, digits, '-', '_' and '.'",
        ));
    }

    let entry = manifest.entry_point.trim();
    if entry.is_empty() {
        return Err(invalid(&name, "entry_point must not be empty"));
    }
    if escapes_directory(Path::new(entry)) {
        return Err(invalid(
            &name,
            format!("entry_point '{entry}' escapes the plugin directory"),
        ));
    }
    if escapes_directory(Path::new(&manifest.source_dir)) {
        return Err(invalid(
            &name,
            format!(
                "source_dir '{}' escapes the plugin directory",
                manifest.source_dir
            ),
        ));
    }

    if manifest.requires.iter().any(|r| r == &name) {
        return Err(invalid(&name, "a plugin cannot require itself"));
    }
    let mut seen = std::collections::HashSet::new();
    manifest.requires.retain(|r| {
        let fresh = seen.insert(r.clone());
        if !fresh {
            warn!(plugin = %name, dependency = %r, "duplicate entry in requires");
        }
        fresh
    });

    let resources = &manifest.resources;
    positive(&name, "resources.timeout_seconds", resources.timeout_seconds)?;
    positive(
        &name,
        "resources.rate_limit.period_seconds",
        resources.rate_limit.period_seconds,
    )?;
    if resources.rate_limit.calls == 0 {
        return Err(invalid(&name, "resources.rate_limit.calls must be at least 1"));
    }
    positive(
        &name,
        "health_check.interval_seconds",
        manifest.health_check.interval_seconds,
    )?;
    positive(
        &name,
        "health_check.timeout_seconds",
        manifest.health_check.timeout_seconds,
    )?;
    if manifest.retry.max_attempts == 0 {
        return Err(invalid(&name, "retry.max_attempts must be at least 1"));
    }
    for (field, value) in [
        ("retry.backoff_seconds", manifest.retry.backoff_seconds),
        ("retry.max_backoff_seconds", manifest.retry.max_backoff_seconds),
    ] {
        if !(value >= 0.0 && Duration::try_from_secs_f64(value).is_ok()) {
            return Err(invalid(
                &name,
                format!("{field} must be a non-negative number of seconds"),
            ));
        }
    }

    Ok(())
}

fn resolve_env(manifest: &mut PluginManifest) -> Result<()> {
    let mut injected = BTreeMap::new();
    if manifest.inject_env {
        let path = manifest.directory.join(ENV_FILE);
        if path.is_file() {
            injected = parse_env_file(&path)?;
            debug!(plugin = %manifest.name, count = injected.len(), "loaded env file");
        } else {
            warn!(
                plugin = %manifest.name,
                path = %path.display(),
                "inject_env is set but no env file exists"
            );
        }
    }

    let ctx = InterpolationContext::new().with_variables(injected.clone());
    let resolved = interpolate_map(&manifest.env, &ctx)
        .map_err(|e| invalid(&manifest.name, format!("{e} in env block")))?;

    injected.extend(resolved);
    manifest.env = injected;
    Ok(())
}

fn required_string(fields: &mut Map<String, Value>, key: &str, plugin: &str) -> Result<String> {
    let value = match fields.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(_) => return Err(invalid(plugin, format!("'{key}' must be a string"))),
    };
    if value.is_empty() {
        return Err(invalid(plugin, format!("missing required field '{key}'")));
    }
    fields.insert(key.to_string(), Value::String(value.clone()));
    Ok(value)
}

fn stringify_scalars(map: &mut Map<String, Value>) {
    for value in map.values_mut() {
        match value {
            Value::Number(n) => *value = Value::String(n.to_string()),
            Value::Bool(b) => *value = Value::String(b.to_string()),
            _ => {}
        }
    }
}

fn escapes_directory(path: &Path) -> bool {
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
}

fn positive(plugin: &str, field: &str, value: f64) -> Result<()> {
    if value > 0.0 && Duration::try_from_secs_f64(value).is_ok() {
        Ok(())
    } else {
        Err(invalid(
            plugin,
            format!("{field} must be a positive number of seconds"),
        ))
    }
}

fn directory_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn invalid(plugin: &str, message: impl Into<String>) -> PalisadeError {
    PalisadeError::Manifest {
        plugin: plugin.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_yaml(content: &str) -> Result<PluginManifest> {
        parse_manifest_str(content, ManifestFormat::Yaml, Path::new("/plugins/demo"))
    }

    #[test]
    fn test_minimal_sandboxed_manifest_gets_defaults() {
        let manifest = parse_yaml(
            "name: demo\nversion: 0.1.0\nexecution_mode: sandboxed\nentry_point: main.py\n",
        )
        .unwrap();
        assert_eq!(manifest.execution_mode, ExecutionMode::Sandboxed);
        assert_eq!(manifest.resources.timeout_seconds, 30.0);
        assert_eq!(manifest.resources.rate_limit.calls, 100);
        assert!(manifest.health_check.enabled);
        assert_eq!(manifest.max_restarts, 3);
        assert_eq!(manifest.directory, Path::new("/plugins/demo"));
    }

    #[test]
    fn test_nested_override_keeps_siblings() {
        let manifest = parse_yaml(
            "name: demo\nversion: '1'\nexecution_mode: sandboxed\nentry_point: main.py\n\
             health_check:\n  enabled: false\nresources:\n  rate_limit:\n    calls: 5\n",
        )
        .unwrap();
        assert!(!manifest.health_check.enabled);
        assert_eq!(manifest.health_check.interval_seconds, 10.0);
        assert_eq!(manifest.resources.rate_limit.calls, 5);
        assert_eq!(manifest.resources.rate_limit.period_seconds, 60.0);
        assert_eq!(manifest.resources.max_memory_mb, 256);
    }

    #[test]
    fn test_trusted_defaults() {
        let manifest = parse_yaml(
            "name: core\nversion: 2.0.0\nexecution_mode: trusted\nentry_point: libcore.so\n",
        )
        .unwrap();
        assert_eq!(manifest.resources.timeout_seconds, 300.0);
        assert!(manifest.filesystem.is_full_access());
        assert_eq!(manifest.retry.max_attempts, 1);
    }

    #[test]
    fn test_numeric_version_is_accepted() {
        let manifest =
            parse_yaml("name: demo\nversion: 1.5\nentry_point: main.py\n").unwrap();
        assert_eq!(manifest.version, "1.5");
    }

    #[test]
    fn test_missing_name_or_version() {
        let err = parse_yaml("version: 1.0.0\nentry_point: main.py\n").unwrap_err();
        assert!(err.to_string().contains("'name'"));
        let err = parse_yaml("name: demo\nversion: ''\nentry_point: main.py\n").unwrap_err();
        assert!(err.to_string().contains("'version'"));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = parse_yaml(
            "name: demo\nversion: 1.0.0\nexecution_mode: isolated\nentry_point: main.py\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("isolated"));
    }

    #[test]
    fn test_entry_point_must_stay_inside() {
        for entry in ["", "../evil.py", "/etc/passwd", "src/../../x.py"] {
            let content = format!("name: demo\nversion: 1.0.0\nentry_point: '{entry}'\n");
            assert!(parse_yaml(&content).is_err(), "accepted {entry:?}");
        }
    }

    #[test]
    fn test_unrepresentable_durations_rejected() {
        let err = parse_manifest_str(
            r#"{"name": "demo", "version": "1", "entry_point": "main.py",
                "resources": {"timeout_seconds": 1e20}}"#,
            ManifestFormat::Json,
            Path::new("/plugins/demo"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("resources.timeout_seconds"));

        let err = parse_yaml(
            "name: demo\nversion: 1.0.0\nentry_point: main.py\n\
             retry:\n  backoff_seconds: 1.0e+300\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry.backoff_seconds"));

        let err = parse_yaml(
            "name: demo\nversion: 1.0.0\nentry_point: main.py\n\
             retry:\n  backoff_seconds: 1.0\n  max_backoff_seconds: 1.0e+300\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry.max_backoff_seconds"));
    }

    #[test]
    fn test_self_requirement_rejected() {
        let err = parse_yaml(
            "name: demo\nversion: 1.0.0\nentry_point: main.py\nrequires: [demo]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_duplicate_requires_collapsed() {
        let manifest = parse_yaml(
            "name: demo\nversion: 1.0.0\nentry_point: main.py\nrequires: [core, core, auth]\n",
        )
        .unwrap();
        assert_eq!(manifest.requires, vec!["core", "auth"]);
    }

    #[test]
    fn test_json_manifest() {
        let manifest = parse_manifest_str(
            r#"{"name": "j", "version": "1", "execution_mode": "legacy", "entry_point": "x.so",
                "extra": {"greeting": "hi"}}"#,
            ManifestFormat::Json,
            Path::new("/plugins/j"),
        )
        .unwrap();
        assert_eq!(manifest.execution_mode, ExecutionMode::Legacy);
        assert_eq!(manifest.extra["greeting"], "hi");
    }

    #[test]
    fn test_env_resolution_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "API_HOST=api.internal\n").unwrap();
        std::fs::write(
            dir.path().join("plugin.yaml"),
            "name: demo\nversion: 1.0.0\nentry_point: main.py\ninject_env: true\n\
             env:\n  URL: https://${API_HOST}/v1\n  PORT: 8080\n  PRICE: $$5\n",
        )
        .unwrap();

        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.env["URL"], "https://api.internal/v1");
        assert_eq!(manifest.env["PORT"], "8080");
        assert_eq!(manifest.env["PRICE"], "$5");
        assert_eq!(manifest.env["API_HOST"], "api.internal");
    }

    #[test]
    fn test_missing_variable_names_plugin_and_variable() {
        let err = parse_yaml(
            "name: demo\nversion: 1.0.0\nentry_point: main.py\n\
             env:\n  KEY: ${PALISADE_SURELY_UNSET_VAR}\n",
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("demo"));
        assert!(message.contains("PALISADE_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_manifest_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            r#"{"name": "from-json", "version": "1", "entry_point": "a.py"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("plugin.yml"),
            "name: from-yml\nversion: 1\nentry_point: a.py\n",
        )
        .unwrap();
        assert_eq!(load_manifest(dir.path()).unwrap().name, "from-yml");
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_manifest(dir.path()).is_none());
        assert!(matches!(
            load_manifest(dir.path()),
            Err(PalisadeError::Manifest { .. })
        ));
    }

    #[test]
    fn test_deep_merge_null_keeps_default() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": 2}});
        deep_merge(&mut base, serde_json::json!({"a": {"b": null, "c": 3}, "d": true}));
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "c": 3}, "d": true}));
    }
}
