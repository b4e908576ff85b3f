//! Path containment for every local filesystem mutation
//!
//! A path is accepted when its resolved form is the sandbox root itself or nested
//! under it. Resolution follows symlinks in the parent directory (and in the leaf
//! when it exists), so a link pointing out of the tree resolves out of the tree
//! and is rejected. Any `..` segment in the raw input is rejected before resolution.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::error;

use crate::error::{Result, ShuttleError};

/// A canonical sandbox root and the checks made against it
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Canonicalize `root`; it must already exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|e| {
            ShuttleError::security_violation(root, root, format!("sandbox root cannot be resolved: {}", e))
        })?;
        Ok(Self { root: canonical })
    }

    /// The canonical root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `path` and return its canonical form.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        if has_parent_traversal(path) {
            error!(input = %path.display(), root = %self.root.display(), "rejected path with '..' segment");
            return Err(ShuttleError::security_violation(
                path,
                &self.root,
                "path contains a '..' segment",
            ));
        }

        let resolved = resolve(path).map_err(|e| {
            error!(input = %path.display(), root = %self.root.display(), "rejected unresolvable path: {}", e);
            ShuttleError::security_violation(path, &self.root, format!("path cannot be resolved: {}", e))
        })?;

        if !is_within(&resolved, &self.root) {
            error!(
                input = %path.display(),
                resolved = %resolved.display(),
                root = %self.root.display(),
                "rejected path outside sandbox"
            );
            return Err(ShuttleError::security_violation(
                resolved,
                &self.root,
                "path resolves outside the sandbox root",
            ));
        }

        Ok(resolved)
    }

    /// Validate `path` and return it relative to the root
    pub fn relative(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.validate(path)?;
        resolved
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|e| ShuttleError::path_error(&resolved, e.to_string()))
    }

    /// Join a caller supplied relative path onto `base` and validate the result.
    pub fn join(&self, base: &Path, relative: &Path) -> Result<PathBuf> {
        if relative.is_absolute() {
            return Err(ShuttleError::security_violation(
                relative,
                &self.root,
                "expected a relative path",
            ));
        }
        self.validate(base.join(relative))
    }
}

/// Free-function form of [`PathSandbox::validate`].
pub fn validate(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<PathBuf> {
    PathSandbox::new(root)?.validate(path)
}

/// True when any component of the raw path is `..`.
pub fn has_parent_traversal(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Component-wise containment: `/a/bFAKE` is not within `/a/b`.
pub fn is_within(candidate: &Path, root: &Path) -> bool {
    candidate == root || candidate.starts_with(root)
}

/// Resolve a path the way containment checks need it.
///
/// Existing paths are canonicalized in full. Otherwise the parent is canonicalized
/// (when it exists) and the final name appended; an absolute path with a missing
/// parent is used as-is, and a relative one is anchored at the working directory.
pub fn resolve(path: &Path) -> io::Result<PathBuf> {
    if path.symlink_metadata().is_ok() {
        return std::fs::canonicalize(path);
    }

    let file_name = match path.file_name() {
        Some(name) => name,
        None => return absolute(path),
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if parent.exists() {
        Ok(std::fs::canonicalize(&parent)?.join(file_name))
    } else {
        absolute(path)
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
