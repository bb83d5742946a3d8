//! Sign and verify command implementations.

use miette::{IntoDiagnostic, Result, miette};
use palisade_engine::RuntimeConfig;
use palisade_security::{SIGNATURE_FILE, SigningKey, sign_plugin, verify_plugin};

use crate::discovery;
use crate::output;

/// Writes a signature file next to the plugin manifest.
pub fn sign(config: &RuntimeConfig, plugin: &str) -> Result<()> {
    let key = require_key(config)?;
    let manifest = discovery::resolve_plugin(config, plugin)?;

    let record = sign_plugin(&manifest, key).into_diagnostic()?;

    output::success(&format!(
        "Signed {} {}",
        record.plugin, record.version
    ));
    output::key_value("file", &manifest.directory.join(SIGNATURE_FILE).display().to_string());
    output::key_value("digest", &record.digest);
    Ok(())
}

/// Checks the plugin's signature file against its current contents.
pub fn verify(config: &RuntimeConfig, plugin: &str) -> Result<()> {
    let key = require_key(config)?;
    let manifest = discovery::resolve_plugin(config, plugin)?;

    match verify_plugin(&manifest, key) {
        Ok(record) => {
            output::success(&format!(
                "Signature of {} {} is valid",
                record.plugin, record.version
            ));
            Ok(())
        }
        Err(e) => {
            output::error(&e.to_string());
            Err(miette!("Verification failed for '{}'", manifest.name))
        }
    }
}

fn require_key(config: &RuntimeConfig) -> Result<&SigningKey> {
    config.signing_key.as_ref().ok_or_else(|| {
        miette!("No signing key: pass --signing-key, --signing-key-file or set PALISADE_SIGNING_KEY")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_sign_then_verify() {
        let dir = tempdir().unwrap();
        let plugin = dir.path().join("core");
        fs::create_dir_all(plugin.join("src")).unwrap();
        fs::write(
            plugin.join("plugin.yaml"),
            "name: core\nversion: '1.0'\nexecution_mode: trusted\nentry_point: src/lib.py\n",
        )
        .unwrap();
        fs::write(plugin.join("src/lib.py"), "import json\n").unwrap();

        let config =
            RuntimeConfig::new(dir.path()).with_signing_key(SigningKey::derive(b"secret"));
        sign(&config, "core").unwrap();
        assert!(plugin.join(SIGNATURE_FILE).is_file());
        verify(&config, "core").unwrap();

        fs::write(plugin.join("src/lib.py"), "import json  \n").unwrap();
        assert!(verify(&config, "core").is_err());
    }

    #[test]
    fn test_missing_key_is_reported() {
        let dir = tempdir().unwrap();
        let config = RuntimeConfig::new(dir.path());
        assert!(sign(&config, "core").is_err());
    }
}
