// src/core/paths.rs

//! Canonical-path containment checks for instance workspaces.
//!
//! File-serving layers must never resolve a caller-supplied path outside
//! the instance workspace. Containment is decided on resolved canonical
//! paths, not string prefixes, so `..` segments and symlink tricks fail.

use crate::core::errors::BlockforgeError;
use std::path::{Component, Path, PathBuf};

/// Resolves `relative` against `base` and verifies the result stays inside
/// `base`. For paths that do not exist yet, the deepest existing ancestor
/// is canonicalized instead.
pub fn confine(base: &Path, relative: &str) -> Result<PathBuf, BlockforgeError> {
    let canonical_base = base.canonicalize().map_err(|e| {
        BlockforgeError::Internal(format!("cannot canonicalize '{}': {e}", base.display()))
    })?;

    let candidate = canonical_base.join(sanitize_relative(relative)?);
    let resolved = resolve_existing_prefix(&candidate)?;
    if !resolved.starts_with(&canonical_base) {
        return Err(BlockforgeError::PermissionDenied);
    }
    Ok(candidate)
}

/// Rejects absolute paths and any parent-directory traversal outright.
fn sanitize_relative(relative: &str) -> Result<PathBuf, BlockforgeError> {
    let path = Path::new(relative);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(BlockforgeError::InvalidArgument(format!(
                    "path '{relative}' escapes the workspace"
                )));
            }
        }
    }
    Ok(clean)
}

/// Canonicalizes the deepest existing ancestor of `path` and re-appends the
/// missing tail, so not-yet-created files still get symlinks resolved.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, BlockforgeError> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize().map_err(|e| {
        BlockforgeError::Internal(format!("cannot canonicalize '{}': {e}", existing.display()))
    })?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}
