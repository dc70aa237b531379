//! Sandboxed path resolution against a trusted workspace root.

use std::path::{Path, PathBuf};

use crate::core::sandbox::normalize_within;
use crate::error::SecurityError;

/// Resolves workspace-relative paths, refusing anything outside `root`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join `relative` onto the root.
    ///
    /// Besides lexical `..` checks, the deepest existing ancestor of the result
    /// is canonicalized so a symlink inside the workspace cannot point out of it.
    pub fn join(&self, relative: &str) -> Result<PathBuf, SecurityError> {
        let joined = normalize_within(&self.root, relative)?;
        let Ok(canonical_root) = self.root.canonicalize() else {
            // Root does not exist yet, so nothing below it can be a symlink.
            return Ok(joined);
        };
        let mut probe = joined.as_path();
        loop {
            if let Ok(resolved) = probe.canonicalize() {
                if !resolved.starts_with(&canonical_root) {
                    return Err(SecurityError::PathEscape {
                        root: self.root.clone(),
                        path: relative.to_string(),
                    });
                }
                return Ok(joined);
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => return Ok(joined),
            }
        }
    }

    /// Join a path that is already relative to the root, e.g. one from config.
    pub fn join_path(&self, relative: &Path) -> Result<PathBuf, SecurityError> {
        self.join(&relative.to_string_lossy())
    }

    /// Render `path` relative to the root for storing in documents.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
