//! Lexical sandboxing for workspace-relative paths.
//!
//! Pure path arithmetic: no filesystem access. Symlink containment is checked
//! on top of this by [`crate::io::paths::Sandbox`].

use std::path::{Component, Path, PathBuf};

use crate::error::SecurityError;

/// Join `relative` onto `root`, resolving `.` and `..` lexically.
///
/// Absolute inputs, drive prefixes and any `..` that would climb above `root`
/// are rejected with [`SecurityError::PathEscape`].
pub fn normalize_within(root: &Path, relative: &str) -> Result<PathBuf, SecurityError> {
    let escape = || SecurityError::PathEscape {
        root: root.to_path_buf(),
        path: relative.to_string(),
    };
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    let mut joined = root.to_path_buf();
    joined.extend(parts);
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_nested_relative_paths() {
        let joined = normalize_within(Path::new("/ws"), "a/./b/../c.txt").expect("join");
        assert_eq!(joined, PathBuf::from("/ws/a/c.txt"));
    }

    #[test]
    fn empty_relative_resolves_to_root() {
        let joined = normalize_within(Path::new("/ws"), "").expect("join");
        assert_eq!(joined, PathBuf::from("/ws"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let err = normalize_within(Path::new("/ws"), "a/../../etc/passwd").unwrap_err();
        assert!(matches!(err, SecurityError::PathEscape { .. }));
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(normalize_within(Path::new("/ws"), "/etc/passwd").is_err());
    }
}
