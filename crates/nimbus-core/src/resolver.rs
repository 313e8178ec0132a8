// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency resolution.
//!
//! Turns symbolic dependency references (`"lodash"`, `"./lib/helpers"`) into
//! concrete locations. A reference is first looked up as a globally known one
//! (a registered built-in, then each global search root) and only then
//! relative to the caller-supplied base directory.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Binding that every inline or module unit must carry.
///
/// The generated entry point uses it to post results back onto the queue.
/// It ships with every Node.js 18+ Lambda runtime, so it is never bundled.
pub const BASELINE_DEPENDENCY: &str = "@aws-sdk/client-sqs";

/// A resolved dependency location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Location {
    /// Provided by the remote runtime; nothing to ship.
    Builtin(String),
    /// A file or package directory on the local file system.
    Path(PathBuf),
}

impl Location {
    /// Whether this location is a built-in binding.
    pub fn is_builtin(&self) -> bool {
        matches!(self, Location::Builtin(_))
    }

    /// Whether this location is the baseline binding.
    pub fn is_baseline(&self) -> bool {
        matches!(self, Location::Builtin(name) if name.eq_ignore_ascii_case(BASELINE_DEPENDENCY))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Builtin(name) => write!(f, "builtin:{}", name),
            Location::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Append the baseline binding unless a case-insensitive match is present.
///
/// Idempotent: calling it repeatedly leaves exactly one baseline entry.
pub fn ensure_baseline(deps: &mut Vec<String>) {
    if !deps
        .iter()
        .any(|d| d.eq_ignore_ascii_case(BASELINE_DEPENDENCY))
    {
        deps.push(BASELINE_DEPENDENCY.to_string());
    }
}

/// Resolves dependency references against built-ins, global roots and a base directory.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    builtins: BTreeSet<String>,
    global_paths: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        let mut builtins = BTreeSet::new();
        builtins.insert(BASELINE_DEPENDENCY.to_string());
        Self {
            builtins,
            global_paths: Vec::new(),
            extensions: vec!["js".to_string(), "json".to_string()],
        }
    }
}

impl DependencyResolver {
    /// Create a resolver knowing only the baseline binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional built-in name.
    pub fn with_builtin(mut self, name: impl Into<String>) -> Self {
        self.builtins.insert(name.into().to_ascii_lowercase());
        self
    }

    /// Add a global search root (searched before the base directory).
    pub fn with_global_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.global_paths.push(root.into());
        self
    }

    /// Replace the file extensions probed after the exact path.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve a single reference.
    ///
    /// Fails with [`Error::ModuleResolution`] naming both attempted locations
    /// when neither the global nor the relative lookup succeeds.
    pub fn resolve(&self, reference: &str, base_dir: &Path) -> Result<Location> {
        if let Some(location) = self.resolve_global(reference) {
            debug!(reference, location = %location, "Resolved dependency globally");
            return Ok(location);
        }

        let attempted = base_dir.join(reference);
        if let Some(path) = self.probe(&attempted) {
            debug!(reference, path = %path.display(), "Resolved dependency relative to base");
            return Ok(Location::Path(path));
        }

        Err(Error::ModuleResolution {
            reference: reference.to_string(),
            base_dir: base_dir.to_path_buf(),
            attempted,
        })
    }

    /// Resolve every reference, preserving order and dropping duplicates.
    pub fn resolve_all(&self, references: &[String], base_dir: &Path) -> Result<Vec<Location>> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            let location = self.resolve(reference, base_dir)?;
            if seen.insert(location.clone()) {
                resolved.push(location);
            }
        }
        Ok(resolved)
    }

    fn resolve_global(&self, reference: &str) -> Option<Location> {
        let trimmed = reference.trim();
        if trimmed.is_empty() || is_relative_reference(trimmed) {
            return None;
        }

        let lowered = trimmed.to_ascii_lowercase();
        if self.builtins.contains(&lowered) {
            return Some(Location::Builtin(lowered));
        }

        let as_path = Path::new(trimmed);
        if as_path.is_absolute() {
            return self.probe(as_path).map(Location::Path);
        }

        self.global_paths
            .iter()
            .find_map(|root| self.probe(&root.join(trimmed)))
            .map(Location::Path)
    }

    /// Exact path, then `<path>.<ext>` for each extension, then a directory.
    fn probe(&self, candidate: &Path) -> Option<PathBuf> {
        if candidate.is_file() {
            return Some(normalize(candidate));
        }

        for ext in &self.extensions {
            let mut with_ext = OsString::from(candidate.as_os_str());
            with_ext.push(".");
            with_ext.push(ext);
            let with_ext = PathBuf::from(with_ext);
            if with_ext.is_file() {
                return Some(normalize(&with_ext));
            }
        }

        if candidate.is_dir() {
            return Some(normalize(candidate));
        }

        None
    }
}

fn is_relative_reference(reference: &str) -> bool {
    reference.starts_with("./") || reference.starts_with("../") || reference == "." || reference == ".."
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_baseline_appends_once() {
        let mut deps = vec!["lodash".to_string()];
        ensure_baseline(&mut deps);
        ensure_baseline(&mut deps);
        assert_eq!(
            deps,
            vec!["lodash".to_string(), "@aws-sdk/client-sqs".to_string()]
        );
    }

    #[test]
    fn test_ensure_baseline_case_insensitive() {
        let mut deps = vec!["@AWS-SDK/Client-SQS".to_string()];
        ensure_baseline(&mut deps);
        ensure_baseline(&mut deps);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0], "@AWS-SDK/Client-SQS");
    }

    #[test]
    fn test_resolve_builtin() {
        let resolver = DependencyResolver::new();
        let location = resolver
            .resolve("@aws-sdk/client-sqs", Path::new("/nowhere"))
            .unwrap();
        assert!(location.is_baseline());
    }

    #[test]
    fn test_resolve_relative_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helper.js"), "module.exports = 1;").unwrap();

        let resolver = DependencyResolver::new();
        let location = resolver.resolve("./helper", dir.path()).unwrap();

        match location {
            Location::Path(path) => assert!(path.ends_with("helper.js")),
            other => panic!("expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_prefers_global_root() {
        let global = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(global.path().join("left-pad")).unwrap();
        std::fs::create_dir(base.path().join("left-pad")).unwrap();

        let resolver = DependencyResolver::new().with_global_path(global.path());
        let location = resolver.resolve("left-pad", base.path()).unwrap();

        assert_eq!(
            location,
            Location::Path(global.path().join("left-pad").canonicalize().unwrap())
        );
    }

    #[test]
    fn test_resolve_failure_names_both_attempts() {
        let base = tempfile::tempdir().unwrap();
        let resolver = DependencyResolver::new();

        let err = resolver.resolve("missing-dep", base.path()).unwrap_err();
        let message = err.to_string();

        assert!(matches!(err, Error::ModuleResolution { .. }));
        assert!(message.contains("missing-dep"));
        assert!(message.contains(&base.path().display().to_string()));
    }

    #[test]
    fn test_resolve_all_dedupes() {
        let resolver = DependencyResolver::new();
        let refs = vec![
            "@aws-sdk/client-sqs".to_string(),
            "@AWS-SDK/client-sqs".to_string(),
        ];
        let resolved = resolver.resolve_all(&refs, Path::new(".")).unwrap();
        assert_eq!(
            resolved,
            vec![Location::Builtin(BASELINE_DEPENDENCY.to_string())]
        );
    }
}
