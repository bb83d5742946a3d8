//! Ways of turning a trusted plugin's entry point into a [`PluginFactory`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use palisade_core::{PalisadeError, PluginManifest, Result};
use palisade_plugin::{ABI_VERSION, ABI_VERSION_SYMBOL, AbiVersionFn, CREATE_SYMBOL, CreateFn, PluginFactory};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Factory for one activation plus whatever keeps its code mapped.
///
/// Fields drop in order, so the factory is gone before its library.
pub struct LoadedCode {
    pub factory: PluginFactory,
    pub library: Option<LoadedLibrary>,
}

/// Source of trusted plugin code.
pub trait CodeLoader: Send + Sync {
    /// Whether this loader handles the manifest's entry point.
    fn can_load(&self, manifest: &PluginManifest) -> bool;

    /// Loads the entry point. `generation` is unique per activation.
    fn load(&self, manifest: &PluginManifest, generation: u64) -> Result<LoadedCode>;
}

/// Factories compiled into the host binary, keyed by entry point.
#[derive(Default)]
pub struct StaticRegistry {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for manifests whose `entry_point` is `entry_point`.
    pub fn register(&self, entry_point: impl Into<String>, factory: PluginFactory) {
        self.factories.write().insert(entry_point.into(), factory);
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.read().contains_key(entry_point)
    }
}

impl fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.factories.read().keys().cloned().collect();
        keys.sort();
        f.debug_struct("StaticRegistry").field("entry_points", &keys).finish()
    }
}

impl CodeLoader for StaticRegistry {
    fn can_load(&self, manifest: &PluginManifest) -> bool {
        self.contains(&manifest.entry_point)
    }

    fn load(&self, manifest: &PluginManifest, _generation: u64) -> Result<LoadedCode> {
        let factory = self
            .factories
            .read()
            .get(&manifest.entry_point)
            .cloned()
            .ok_or_else(|| PalisadeError::Load {
                plugin: manifest.name.clone(),
                message: format!("no factory registered for '{}'", manifest.entry_point),
            })?;
        Ok(LoadedCode {
            factory,
            library: None,
        })
    }
}

/// Loads plugins exported with `palisade_plugin::export_plugin!` from
/// dynamic libraries.
///
/// Each activation maps a private copy of the library, so a reload never
/// reuses an image the platform loader has cached.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    scratch_dir: PathBuf,
}

impl DylibLoader {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Scratch path of the copy made for `generation`.
    pub fn scratch_path(&self, manifest: &PluginManifest, generation: u64) -> PathBuf {
        let file = Path::new(&manifest.entry_point)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());
        self.scratch_dir
            .join(format!("{}-{}-{}", manifest.name, generation, file))
    }
}

impl CodeLoader for DylibLoader {
    fn can_load(&self, manifest: &PluginManifest) -> bool {
        manifest
            .entry_path()
            .extension()
            .is_some_and(|ext| ext == std::env::consts::DLL_EXTENSION)
    }

    fn load(&self, manifest: &PluginManifest, generation: u64) -> Result<LoadedCode> {
        let plugin = &manifest.name;
        let load_error = |message: String| PalisadeError::Load {
            plugin: plugin.clone(),
            message,
        };

        let source = manifest.entry_path();
        let copy = self.scratch_path(manifest, generation);
        std::fs::create_dir_all(&self.scratch_dir)?;
        std::fs::copy(&source, &copy)
            .map_err(|e| load_error(format!("cannot copy {}: {e}", source.display())))?;

        // SAFETY: loading runs the library's initializers. Trusted plugins are
        // vetted by signature before reaching this point.
        let library = match unsafe { Library::new(&copy) } {
            Ok(library) => library,
            Err(e) => {
                let _ = std::fs::remove_file(&copy);
                return Err(load_error(format!("cannot load {}: {e}", source.display())));
            }
        };
        let loaded = LoadedLibrary {
            library: Some(library),
            copy,
        };
        let factory = loaded.factory(plugin)?;

        debug!(plugin = %plugin, generation, path = %loaded.copy.display(), "loaded plugin library");
        Ok(LoadedCode {
            factory,
            library: Some(loaded),
        })
    }
}

/// A mapped plugin library. Dropping it closes the library and deletes the
/// scratch copy.
pub struct LoadedLibrary {
    library: Option<Library>,
    copy: PathBuf,
}

impl LoadedLibrary {
    pub fn path(&self) -> &Path {
        &self.copy
    }

    fn factory(&self, plugin: &str) -> Result<PluginFactory> {
        let load_error = |message: String| PalisadeError::Load {
            plugin: plugin.to_string(),
            message,
        };
        let library = self
            .library
            .as_ref()
            .ok_or_else(|| load_error("library already closed".to_string()))?;

        // SAFETY: the symbols are declared by `export_plugin!` with exactly
        // these signatures. The ABI version is checked before the constructor
        // is trusted.
        unsafe {
            let abi: Symbol<AbiVersionFn> = library
                .get(ABI_VERSION_SYMBOL)
                .map_err(|e| load_error(format!("missing ABI version symbol: {e}")))?;
            let version = abi();
            if version != ABI_VERSION {
                return Err(load_error(format!(
                    "plugin ABI version {version} does not match runtime version {ABI_VERSION}"
                )));
            }

            let create: Symbol<CreateFn> = library
                .get(CREATE_SYMBOL)
                .map_err(|e| load_error(format!("missing constructor symbol: {e}")))?;
            let raw = create();
            if raw.is_null() {
                return Err(load_error("plugin constructor returned null".to_string()));
            }
            Ok(PluginFactory::from_raw(raw))
        }
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        if let Some(library) = self.library.take()
            && let Err(e) = library.close()
        {
            warn!(path = %self.copy.display(), error = %e, "failed to close plugin library");
        }
        if let Err(e) = std::fs::remove_file(&self.copy) {
            debug!(path = %self.copy.display(), error = %e, "scratch copy already gone");
        }
    }
}

impl fmt::Debug for LoadedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedLibrary")
            .field("copy", &self.copy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use palisade_parser::{ManifestFormat, parse_manifest_str};
    use palisade_plugin::{Plugin, PluginFault};
    use serde_json::Value;
    use tempfile::TempDir;

    struct Nop;

    #[async_trait]
    impl Plugin for Nop {
        async fn handle(&self, _action: &str, payload: Value) -> std::result::Result<Value, PluginFault> {
            Ok(payload)
        }
    }

    fn manifest(dir: &Path, entry_point: &str) -> PluginManifest {
        parse_manifest_str(
            &format!(
                r#"{{"name": "nop", "version": "1", "execution_mode": "trusted",
                    "entry_point": "{entry_point}"}}"#
            ),
            ManifestFormat::Json,
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_static_registry() {
        let registry = StaticRegistry::new();
        registry.register("builtin:nop", PluginFactory::plain(|| Box::new(Nop)));

        let known = manifest(Path::new("/plugins/nop"), "builtin:nop");
        let unknown = manifest(Path::new("/plugins/nop"), "builtin:other");
        assert!(registry.can_load(&known));
        assert!(!registry.can_load(&unknown));

        let code = registry.load(&known, 1).unwrap();
        assert!(code.library.is_none());
        assert!(registry.load(&unknown, 1).is_err());
    }

    #[test]
    fn test_dylib_scratch_names_are_unique() {
        let scratch = TempDir::new().unwrap();
        let loader = DylibLoader::new(scratch.path());
        let lib = format!("libnop.{}", std::env::consts::DLL_EXTENSION);
        let manifest = manifest(Path::new("/plugins/nop"), &format!("target/{lib}"));

        assert!(loader.can_load(&manifest));
        assert_eq!(
            loader.scratch_path(&manifest, 7),
            scratch.path().join(format!("nop-7-{lib}"))
        );
        assert_ne!(
            loader.scratch_path(&manifest, 1),
            loader.scratch_path(&manifest, 2)
        );
    }

    #[test]
    fn test_dylib_rejects_non_library_and_purges_copy() {
        let scratch = TempDir::new().unwrap();
        let plugin_dir = TempDir::new().unwrap();
        let lib = format!("libbroken.{}", std::env::consts::DLL_EXTENSION);
        std::fs::write(plugin_dir.path().join(&lib), b"not a shared object").unwrap();

        let loader = DylibLoader::new(scratch.path().join("libs"));
        let manifest = manifest(plugin_dir.path(), &lib);
        let err = match loader.load(&manifest, 3) {
            Ok(_) => panic!("garbage must not load"),
            Err(e) => e,
        };
        assert_eq!(err.code(), "load_error");
        assert!(!loader.scratch_path(&manifest, 3).exists());
    }
}
