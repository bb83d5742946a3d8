//! Palisade Parser - Plugin manifest and `.env` parsing.

mod combinators;
mod envfile;
mod error;
mod lexer;
mod manifest;

pub use envfile::{ENV_FILE, parse_env_file, parse_env_str};
pub use error::ParseError;
pub use manifest::{
    MANIFEST_FILES, ManifestFormat, deep_merge, find_manifest, load_manifest, parse_manifest_str,
};
