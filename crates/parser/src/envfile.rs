//! Plugin-local `.env` file loading.

use std::collections::BTreeMap;
use std::path::Path;

use nom::{Parser, combinator::all_consuming};

use palisade_core::{PalisadeError, Result};

use crate::combinators;
use crate::error::ParseError;
use crate::lexer::span;

/// Name of the env file looked up in a plugin directory.
pub const ENV_FILE: &str = ".env";

/// Parses env file content into `(key, value)` pairs, in file order.
pub fn parse_env_str(content: &str) -> std::result::Result<Vec<(String, String)>, ParseError> {
    let mut vars = Vec::new();
    let mut offset = 0;

    for raw_line in content.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        match all_consuming(combinators::env_line).parse(span(line)) {
            Ok((_, Some(pair))) => vars.push(pair),
            Ok((_, None)) => {}
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
                return Err(ParseError::new(
                    "expected KEY=value, a comment or a blank line",
                    content,
                    offset + e.input.location_offset(),
                ));
            }
            Err(nom::Err::Incomplete(_)) => return Err(ParseError::eof(content)),
        }
        offset += raw_line.len();
    }

    Ok(vars)
}

/// Reads and parses an env file. Later assignments win.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|source| PalisadeError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let vars = parse_env_str(&content).map_err(|e| PalisadeError::Manifest {
        plugin: plugin_label(path),
        message: format!("{}: {e}", path.display()),
    })?;

    Ok(vars.into_iter().collect())
}

fn plugin_label(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unknown>".to_string())
}
