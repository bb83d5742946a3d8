//! Keyed BLAKE3 signatures over a plugin's manifest and sources.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use palisade_core::{PalisadeError, PluginManifest, Result};
use palisade_parser::find_manifest;

/// File the signature record is stored in, next to the manifest.
pub const SIGNATURE_FILE: &str = "plugin.sig";

const KEY_CONTEXT: &str = "palisade 2025-01-01 plugin signature v1";

/// Secret key used to sign and verify plugins.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    /// Derives a key from an operator secret.
    pub fn derive(secret: &[u8]) -> Self {
        Self(blake3::derive_key(KEY_CONTEXT, secret))
    }

    /// Derives a key from the trimmed contents of a key file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let secret = std::fs::read_to_string(path).map_err(|source| PalisadeError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(PalisadeError::Signature {
                plugin: path.display().to_string(),
                message: "signing key file is empty".to_string(),
            });
        }
        Ok(Self::derive(secret.as_bytes()))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

/// Persisted signature of one plugin version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub plugin: String,
    pub version: String,
    /// Hex-encoded keyed digest.
    pub digest: String,
}

/// Computes the keyed digest of the manifest file and every signed file.
pub fn compute_digest(manifest: &PluginManifest, key: &SigningKey) -> Result<blake3::Hash> {
    let manifest_path = find_manifest(&manifest.directory)
        .ok_or_else(|| signature_error(manifest, "manifest file not found"))?;
    let manifest_bytes = read(&manifest_path)?;

    let mut hasher = blake3::Hasher::new_keyed(&key.0);
    frame(&mut hasher, b"manifest");
    frame(&mut hasher, &manifest_bytes);

    for (relative, path) in signed_files(manifest)? {
        frame(&mut hasher, relative.as_bytes());
        frame(&mut hasher, &read(&path)?);
    }

    Ok(hasher.finalize())
}

/// Signs the plugin and writes its `plugin.sig`.
pub fn sign_plugin(manifest: &PluginManifest, key: &SigningKey) -> Result<SignatureRecord> {
    let digest = compute_digest(manifest, key)?;
    let record = SignatureRecord {
        plugin: manifest.name.clone(),
        version: manifest.version.clone(),
        digest: digest.to_hex().to_string(),
    };

    let path = manifest.directory.join(SIGNATURE_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    info!(plugin = %manifest.name, version = %manifest.version, "plugin signed");
    Ok(record)
}

/// Reads the signature record stored in `dir`.
pub fn read_signature(dir: &Path) -> Result<Option<SignatureRecord>> {
    let path = dir.join(SIGNATURE_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let content = read(&path)?;
    Ok(Some(serde_json::from_slice(&content)?))
}

/// Checks that the plugin carries a valid, current signature.
pub fn verify_plugin(manifest: &PluginManifest, key: &SigningKey) -> Result<SignatureRecord> {
    let record = match read_signature(&manifest.directory) {
        Ok(Some(record)) => record,
        Ok(None) => return Err(signature_error(manifest, "no plugin.sig found")),
        Err(e) => return Err(signature_error(manifest, &format!("malformed plugin.sig: {e}"))),
    };

    if record.plugin != manifest.name {
        return Err(signature_error(
            manifest,
            &format!("signature belongs to plugin '{}'", record.plugin),
        ));
    }
    if record.version != manifest.version {
        return Err(signature_error(
            manifest,
            &format!(
                "signature is for version {} but the manifest declares {}",
                record.version, manifest.version
            ),
        ));
    }

    let expected = blake3::Hash::from_hex(record.digest.as_str())
        .map_err(|e| signature_error(manifest, &format!("malformed digest: {e}")))?;
    let actual = compute_digest(manifest, key)?;

    // blake3::Hash equality is constant-time.
    if expected != actual {
        return Err(signature_error(
            manifest,
            "digest mismatch, plugin contents changed since signing",
        ));
    }

    debug!(plugin = %manifest.name, "signature verified");
    Ok(record)
}

/// Files covered by the signature as `(relative path, absolute path)`, sorted.
/// Any symbolic link in the tree is an error.
fn signed_files(manifest: &PluginManifest) -> Result<Vec<(String, PathBuf)>> {
    let root = &manifest.directory;
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for entry in WalkDir::new(manifest.source_path())
        .into_iter()
        .filter_entry(|entry| entry.file_name() != "__pycache__")
        .filter_map(|entry| entry.ok())
    {
        if entry.depth() > 0 && entry.path_is_symlink() {
            return Err(symlink_error(manifest, root, entry.path()));
        }
        if entry.file_type().is_file() && entry.file_name() != SIGNATURE_FILE {
            files.push((relative_name(root, entry.path()), entry.into_path()));
        }
    }

    let entry = manifest.entry_path();
    if entry.is_symlink() {
        return Err(symlink_error(manifest, root, &entry));
    }
    if entry.is_file() && !files.iter().any(|(_, path)| path == &entry) {
        files.push((relative_name(root, &entry), entry));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn symlink_error(manifest: &PluginManifest, root: &Path, path: &Path) -> PalisadeError {
    signature_error(
        manifest,
        &format!(
            "symbolic link '{}' cannot be covered by a signature",
            relative_name(root, path)
        ),
    )
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn frame(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| PalisadeError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

fn signature_error(manifest: &PluginManifest, message: &str) -> PalisadeError {
    PalisadeError::Signature {
        plugin: manifest.name.clone(),
        message: message.to_string(),
    }
}
