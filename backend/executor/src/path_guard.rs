//! Handler path validation.
//!
//! A job's handler is a path relative to its module root. Before anything
//! touches the filesystem on its behalf the path must pass two independent
//! checks: the raw string may not contain a `..` segment or be absolute, and
//! the joined path must still sit under the module root, both lexically and
//! (when it exists) after symlinks are resolved.

use std::path::{Component, Path, PathBuf};

use jobforge_core::HandlerLoadError;

/// Validate `relative` against `root` and return the absolute handler path.
pub fn validate_handler_path(root: &Path, relative: &str) -> Result<PathBuf, HandlerLoadError> {
    if relative.trim().is_empty() {
        return Err(HandlerLoadError::Invalid {
            path: root.to_path_buf(),
            reason: "handler path is empty".to_string(),
        });
    }

    check_relative(relative)?;

    let root = normalize(root);
    let joined = normalize(&root.join(relative));
    if !joined.starts_with(&root) {
        return Err(HandlerLoadError::Traversal(relative.to_string()));
    }

    if joined.exists() {
        let canonical_root = root
            .canonicalize()
            .map_err(|_| HandlerLoadError::NotFound(root.clone()))?;
        let canonical = joined.canonicalize().map_err(|e| HandlerLoadError::Invalid {
            path: joined.clone(),
            reason: e.to_string(),
        })?;
        if !canonical.starts_with(&canonical_root) {
            return Err(HandlerLoadError::Traversal(relative.to_string()));
        }
        return Ok(canonical);
    }

    Ok(joined)
}

/// The un-resolved path must not carry parent segments or an absolute anchor,
/// whichever separator style it uses.
fn check_relative(relative: &str) -> Result<(), HandlerLoadError> {
    let traversal = || HandlerLoadError::Traversal(relative.to_string());

    if relative.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(traversal());
    }
    if relative.starts_with('/') || relative.starts_with('\\') {
        return Err(traversal());
    }
    // Drive prefixes such as `C:` on any platform.
    let bytes = relative.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(traversal());
    }
    if Path::new(relative).is_absolute() {
        return Err(traversal());
    }
    Ok(())
}

/// Lexical normalisation: drops `.` and folds `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
