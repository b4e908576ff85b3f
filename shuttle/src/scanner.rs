//! Directory walking for size preflight, native copy planning and listings

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::error::{Result, ShuttleError};
use crate::preservation::get_permissions;

/// One entry below a scan root
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Relative to the scan root; a file root is named by its file name
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
    /// Symlinks are reported, never followed
    pub is_symlink: bool,
    pub permissions: u32,
}

/// Walks a tree in file-name order without following links
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryScanner;

impl DirectoryScanner {
    /// Every entry below `root`, the root itself excluded.
    ///
    /// A file root yields a single entry whose relative path is its file name.
    pub fn scan(&self, root: impl AsRef<Path>) -> Result<Vec<FileEntry>> {
        let root = root.as_ref();
        let root_meta = std::fs::metadata(root).map_err(|e| {
            ShuttleError::path_error(root, format!("Failed to read metadata: {}", e))
        })?;

        if !root_meta.is_dir() {
            let name = root
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| ShuttleError::path_error(root, "Path has no file name"))?;
            return Ok(vec![entry_from(root, name, &root_meta, false)]);
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| ShuttleError::path_error(root, format!("Walk error: {}", e)))?;
            // symlink_metadata: a link is copied as a link
            let metadata = std::fs::symlink_metadata(entry.path()).map_err(|e| {
                ShuttleError::path_error(entry.path(), format!("Failed to read metadata: {}", e))
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| ShuttleError::path_error(entry.path(), e.to_string()))?
                .to_path_buf();

            entries.push(entry_from(entry.path(), relative, &metadata, entry.path_is_symlink()));
        }

        Ok(entries)
    }

    /// Regular files only
    pub fn files(&self, root: impl AsRef<Path>) -> Result<Vec<FileEntry>> {
        Ok(self
            .scan(root)?
            .into_iter()
            .filter(|entry| !entry.is_dir && !entry.is_symlink)
            .collect())
    }
}

/// Total size in bytes of a file or directory tree.
///
/// A symlinked root is followed one level; links below it are not counted.
pub fn total_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(|e| {
        ShuttleError::path_error(path, format!("Failed to read metadata: {}", e))
    })?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| ShuttleError::path_error(path, format!("Walk error: {}", e)))?;
        if entry.file_type().is_file() {
            let len = entry
                .metadata()
                .map_err(|e| ShuttleError::path_error(entry.path(), e.to_string()))?
                .len();
            total = total.saturating_add(len);
        }
    }
    Ok(total)
}

fn entry_from(path: &Path, relative_path: PathBuf, metadata: &std::fs::Metadata, is_symlink: bool) -> FileEntry {
    FileEntry {
        path: path.to_path_buf(),
        relative_path,
        size: metadata.len(),
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: metadata.is_dir(),
        is_symlink,
        permissions: get_permissions(metadata),
    }
}
