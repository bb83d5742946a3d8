//! Static import scanner for Python plugin sources.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use palisade_core::{PalisadeError, PluginManifest, Result};

/// Modules that give access to processes, the filesystem, the network or
/// interpreter internals.
pub const FORBIDDEN_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "cffi",
    "importlib",
    "multiprocessing",
    "threading",
    "_thread",
    "signal",
    "pickle",
    "marshal",
    "shelve",
    "builtins",
    "__builtin__",
    "inspect",
    "gc",
    "pty",
    "fcntl",
    "resource",
    "mmap",
    "urllib",
    "http",
    "ftplib",
    "telnetlib",
    "smtplib",
    "requests",
    "asyncio.subprocess",
    "code",
    "codeop",
    "runpy",
    "tempfile",
    "glob",
    "pathlib",
];

/// Modules considered safe for plugin code.
pub const ALLOWED_MODULES: &[&str] = &[
    "json",
    "re",
    "math",
    "cmath",
    "datetime",
    "time",
    "typing",
    "dataclasses",
    "collections",
    "itertools",
    "functools",
    "operator",
    "enum",
    "decimal",
    "fractions",
    "uuid",
    "hashlib",
    "hmac",
    "base64",
    "binascii",
    "string",
    "textwrap",
    "random",
    "secrets",
    "statistics",
    "logging",
    "asyncio",
    "copy",
    "abc",
    "contextlib",
    "bisect",
    "heapq",
    "zoneinfo",
    "__future__",
];

/// Call targets that load or run code chosen at runtime.
const DYNAMIC_CALLS: &[&str] = &["__import__", "exec", "eval", "compile"];

/// Module loaders that are flagged wherever they are called or imported from.
const LOADER_FUNCTIONS: &[&str] = &["import_module", "__import__"];

/// What kind of problem a finding reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    ForbiddenImport,
    DynamicImport,
    UnknownImport,
    SyntaxError,
    MissingSource,
    Unreadable,
}

/// A single scanner finding.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// File relative to the scanned directory.
    pub file: PathBuf,
    /// One-based line, zero when not tied to a line.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
        } else {
            write!(f, "{}: {}", self.file.display(), self.message)
        }
    }
}

/// Outcome of scanning one plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub plugin: String,
    pub files_scanned: usize,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl ScanReport {
    fn new(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            files_scanned: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts a failed report into a `Scan` error.
    pub fn into_result(self) -> Result<ScanReport> {
        if self.passed() {
            Ok(self)
        } else {
            Err(PalisadeError::Scan {
                plugin: self.plugin.clone(),
                findings: self.errors.iter().map(ToString::to_string).collect(),
            })
        }
    }

    fn push(&mut self, kind: FindingKind, file: &Path, line: usize, message: String) {
        let finding = Finding {
            kind,
            file: file.to_path_buf(),
            line,
            message,
        };
        match kind {
            FindingKind::UnknownImport => self.warnings.push(finding),
            _ => self.errors.push(finding),
        }
    }

    fn sort(&mut self) {
        let key = |f: &Finding| (f.file.clone(), f.line);
        self.errors.sort_by_key(key);
        self.warnings.sort_by_key(key);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Forbidden(String),
    Unknown,
}

/// Classifies Python imports against forbidden and allowed module sets.
#[derive(Debug, Clone)]
pub struct Scanner {
    forbidden: BTreeSet<String>,
    allowed: BTreeSet<String>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            forbidden: FORBIDDEN_MODULES.iter().map(|m| m.to_string()).collect(),
            allowed: ALLOWED_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module to the forbidden set.
    pub fn with_forbidden(mut self, module: impl Into<String>) -> Self {
        let module = module.into();
        self.allowed.remove(&module);
        self.forbidden.insert(module);
        self
    }

    /// Adds a module to the allowed set.
    pub fn with_allowed(mut self, module: impl Into<String>) -> Self {
        let module = module.into();
        self.forbidden.remove(&module);
        self.allowed.insert(module);
        self
    }

    /// Scans the manifest's source subtree.
    pub fn scan_plugin(&self, manifest: &PluginManifest) -> ScanReport {
        self.scan_dir(
            &manifest.name,
            &manifest.source_path(),
            &manifest.allowed_imports,
        )
    }

    /// Scans every `.py` file below `dir`.
    pub fn scan_dir(&self, plugin: &str, dir: &Path, whitelist: &[String]) -> ScanReport {
        let mut report = ScanReport::new(plugin);

        if !dir.is_dir() {
            report.push(
                FindingKind::MissingSource,
                dir,
                0,
                "source directory does not exist".to_string(),
            );
            return report;
        }

        let files = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "py"));

        for entry in files {
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            match std::fs::read_to_string(entry.path()) {
                Ok(source) => self.scan_source(&source, relative, whitelist, &mut report),
                Err(e) => report.push(
                    FindingKind::Unreadable,
                    relative,
                    0,
                    format!("cannot read file: {e}"),
                ),
            }
            report.files_scanned += 1;
        }

        report.sort();
        debug!(
            plugin,
            files = report.files_scanned,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "scan finished"
        );
        report
    }

    /// Scans one source file, appending findings to `report`.
    pub fn scan_source(
        &self,
        source: &str,
        file: &Path,
        whitelist: &[String],
        report: &mut ScanReport,
    ) {
        let mut parser = tree_sitter::Parser::new();
        if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            report.push(
                FindingKind::SyntaxError,
                file,
                0,
                format!("parser initialisation failed: {e}"),
            );
            return;
        }
        let Some(tree) = parser.parse(source, None) else {
            report.push(
                FindingKind::SyntaxError,
                file,
                0,
                "parsing failed".to_string(),
            );
            return;
        };

        let bytes = source.as_bytes();
        let mut syntax_error_reported = false;
        let mut stack = vec![tree.root_node()];

        while let Some(node) = stack.pop() {
            let line = node.start_position().row + 1;

            if (node.is_error() || node.is_missing()) && !syntax_error_reported {
                syntax_error_reported = true;
                report.push(FindingKind::SyntaxError, file, line, "syntax error".to_string());
            }

            match node.kind() {
                "import_statement" => {
                    let mut cursor = node.walk();
                    for child in node.named_children(&mut cursor) {
                        if let Some(module) = imported_name(child, bytes) {
                            self.check_import(&module, &[], whitelist, file, line, report);
                        }
                    }
                }
                "import_from_statement" => {
                    let Some(module_node) = node.child_by_field_name("module_name") else {
                        continue;
                    };
                    if module_node.kind() == "relative_import" {
                        continue;
                    }
                    let Ok(module) = module_node.utf8_text(bytes) else {
                        continue;
                    };
                    let mut names = Vec::new();
                    let mut cursor = node.walk();
                    for child in node.named_children(&mut cursor) {
                        if child.id() == module_node.id() {
                            continue;
                        }
                        if let Some(name) = imported_name(child, bytes) {
                            names.push(name);
                        }
                    }
                    for name in names.iter().filter(|n| binds_loader(module, n)) {
                        report.push(
                            FindingKind::DynamicImport,
                            file,
                            line,
                            format!("dynamic code loading via '{module}.{name}' is not allowed"),
                        );
                    }
                    self.check_import(module, &names, whitelist, file, line, report);
                }
                "exec_statement" => report.push(
                    FindingKind::DynamicImport,
                    file,
                    line,
                    "dynamic code loading via 'exec' is not allowed".to_string(),
                ),
                "call" => {
                    if let Some(target) = dynamic_call_target(node, bytes) {
                        report.push(
                            FindingKind::DynamicImport,
                            file,
                            line,
                            format!("dynamic code loading via '{target}' is not allowed"),
                        );
                    }
                }
                _ => {}
            }

            let mut cursor = node.walk();
            stack.extend(node.children(&mut cursor));
        }
    }

    fn check_import(
        &self,
        module: &str,
        names: &[String],
        whitelist: &[String],
        file: &Path,
        line: usize,
        report: &mut ScanReport,
    ) {
        let verdict = std::iter::once(self.classify(module, whitelist))
            .chain(
                names
                    .iter()
                    .map(|name| self.classify(&format!("{module}.{name}"), whitelist)),
            )
            .find(|v| matches!(v, Verdict::Forbidden(_)))
            .unwrap_or_else(|| self.classify(module, whitelist));

        match verdict {
            Verdict::Allowed => {}
            Verdict::Forbidden(matched) => report.push(
                FindingKind::ForbiddenImport,
                file,
                line,
                format!("import of forbidden module '{matched}'"),
            ),
            Verdict::Unknown => report.push(
                FindingKind::UnknownImport,
                file,
                line,
                format!("import of unreviewed module '{module}'"),
            ),
        }
    }

    fn classify(&self, module: &str, whitelist: &[String]) -> Verdict {
        let top = module.split('.').next().unwrap_or(module);

        let whitelisted = whitelist.iter().any(|w| {
            w == module || w == top || module.strip_prefix(w.as_str()).is_some_and(|r| r.starts_with('.'))
        });
        if whitelisted {
            return Verdict::Allowed;
        }

        let parts: Vec<&str> = module.split('.').collect();
        for len in (1..=parts.len()).rev() {
            let prefix = parts[..len].join(".");
            if self.forbidden.contains(&prefix) {
                return Verdict::Forbidden(prefix);
            }
        }

        if self.allowed.contains(module) || self.allowed.contains(top) {
            Verdict::Allowed
        } else {
            Verdict::Unknown
        }
    }
}

/// Name bound by an import clause: `a.b` or the `a.b` of `a.b as c`.
fn imported_name(node: tree_sitter::Node<'_>, source: &[u8]) -> Option<String> {
    let target = match node.kind() {
        "dotted_name" => node,
        "aliased_import" => node.child_by_field_name("name")?,
        _ => return None,
    };
    target.utf8_text(source).ok().map(str::to_string)
}

/// Whether `from module import name` brings a code loader into scope.
fn binds_loader(module: &str, name: &str) -> bool {
    LOADER_FUNCTIONS.contains(&name)
        || (matches!(module, "builtins" | "__builtin__") && DYNAMIC_CALLS.contains(&name))
}

fn dynamic_call_target(node: tree_sitter::Node<'_>, source: &[u8]) -> Option<String> {
    let function = node.child_by_field_name("function")?;
    match function.kind() {
        "identifier" => {
            let name = function.utf8_text(source).ok()?;
            (DYNAMIC_CALLS.contains(&name) || LOADER_FUNCTIONS.contains(&name))
                .then(|| name.to_string())
        }
        "attribute" => {
            let attribute = function.child_by_field_name("attribute")?.utf8_text(source).ok()?;
            let object = function.child_by_field_name("object")?.utf8_text(source).ok()?;
            let reflective = LOADER_FUNCTIONS.contains(&attribute)
                || (matches!(object, "builtins" | "__builtins__")
                    && DYNAMIC_CALLS.contains(&attribute));
            reflective.then(|| format!("{object}.{attribute}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str, whitelist: &[&str]) -> ScanReport {
        let whitelist: Vec<String> = whitelist.iter().map(|s| s.to_string()).collect();
        let mut report = ScanReport::new("test");
        Scanner::new().scan_source(source, Path::new("main.py"), &whitelist, &mut report);
        report
    }

    #[test]
    fn test_os_import_fails() {
        let report = scan("import os\n", &[]);
        assert!(!report.passed());
        assert_eq!(report.errors[0].kind, FindingKind::ForbiddenImport);
        assert_eq!(report.errors[0].line, 1);
    }

    #[test]
    fn test_json_and_re_pass() {
        let report = scan("import json\nimport re\nfrom datetime import datetime\n", &[]);
        assert!(report.passed());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_aliased_and_submodule_imports() {
        let report = scan("import subprocess as sp\nimport os.path\n", &[]);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_from_import_of_forbidden_submodule() {
        let report = scan("import asyncio\nfrom asyncio import subprocess\n", &[]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("asyncio.subprocess"));
        assert_eq!(report.errors[0].line, 2);
    }

    #[test]
    fn test_unknown_import_is_warning() {
        let report = scan("import numpy\n", &[]);
        assert!(report.passed());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, FindingKind::UnknownImport);
    }

    #[test]
    fn test_whitelist_overrides_sets() {
        let report = scan("import numpy\nimport os\n", &["numpy", "os"]);
        assert!(report.passed());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_relative_imports_allowed() {
        let report = scan("from . import helpers\nfrom .models import User\n", &[]);
        assert!(report.passed());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_dynamic_imports_always_fail() {
        let source = "import importlib\n\
                      m = __import__('os')\n\
                      n = importlib.import_module('socket')\n\
                      exec('print(1)')\n\
                      eval('1+1')\n\
                      compile('x', 'f', 'exec')\n";
        let report = scan(source, &["importlib"]);
        let dynamic = report
            .errors
            .iter()
            .filter(|f| f.kind == FindingKind::DynamicImport)
            .count();
        assert_eq!(dynamic, 5);
        assert!(
            report
                .errors
                .iter()
                .all(|f| f.kind == FindingKind::DynamicImport)
        );
    }

    #[test]
    fn test_loader_imported_by_name_fails() {
        let report = scan(
            "from importlib import import_module\nm = import_module('os')\nm.system('id')\n",
            &["importlib"],
        );
        assert!(!report.passed());
        let mut lines: Vec<usize> = report
            .errors
            .iter()
            .filter(|f| f.kind == FindingKind::DynamicImport)
            .map(|f| f.line)
            .collect();
        lines.sort();
        assert_eq!(lines, vec![1, 2]);

        let report = scan(
            "from importlib import import_module as load\nload('socket')\n",
            &["importlib"],
        );
        assert!(!report.passed());
        assert!(report.errors[0].message.contains("importlib.import_module"));
    }

    #[test]
    fn test_method_named_compile_is_fine() {
        let report = scan("import re\npattern = re.compile('a+')\n", &[]);
        assert!(report.passed());
    }

    #[test]
    fn test_syntax_error_fails() {
        let report = scan("def broken(:\n    pass\n", &[]);
        assert!(
            report
                .errors
                .iter()
                .any(|f| f.kind == FindingKind::SyntaxError)
        );
    }

    #[test]
    fn test_missing_source_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let report = Scanner::new().scan_dir("p", &dir.path().join("src"), &[]);
        assert!(!report.passed());
        assert_eq!(report.errors[0].kind, FindingKind::MissingSource);
    }

    #[test]
    fn test_scan_dir_walks_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("pkg")).unwrap();
        std::fs::write(src.join("main.py"), "import json\n").unwrap();
        std::fs::write(src.join("pkg/net.py"), "import json\nimport socket\n").unwrap();
        std::fs::write(src.join("README.md"), "import os").unwrap();

        let report = Scanner::new().scan_dir("p", &src, &[]);
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file, Path::new("pkg/net.py"));
        assert_eq!(report.errors[0].line, 2);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, PalisadeError::Scan { .. }));
    }

    #[test]
    fn test_custom_sets() {
        let scanner = Scanner::new().with_allowed("pathlib").with_forbidden("random");
        let mut report = ScanReport::new("p");
        scanner.scan_source(
            "import pathlib\nimport random\n",
            Path::new("a.py"),
            &[],
            &mut report,
        );
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("random"));
    }
}
