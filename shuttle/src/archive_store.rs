//! Optional archival store that receives a copy of each completed transfer
//!
//! Store failures are reported to the caller, who logs them and carries on: a
//! transfer that already completed is never rolled back because its archive copy
//! failed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, ShuttleError};
use crate::layout::archive_stamp;
use crate::preservation::AttributePreserver;
use crate::scanner::DirectoryScanner;

/// Archive, list and restore snapshots keyed by server
#[allow(async_fn_in_trait)]
pub trait ArchiveStore {
    /// Store a snapshot of `source`; returns the key of the snapshot
    async fn archive(&self, server_id: &str, source: &Path) -> Result<String>;

    /// Snapshot keys for `server_id`, oldest first
    async fn list(&self, server_id: &str) -> Result<Vec<String>>;

    /// Copy a snapshot into `destination`; returns bytes written
    async fn restore(&self, key: &str, destination: &Path) -> Result<u64>;
}

/// Snapshots as plain directories: `<root>/<server>/<timestamp>/<name>`
#[derive(Debug, Clone)]
pub struct DirectoryArchiveStore {
    root: PathBuf,
    preserver: AttributePreserver,
}

impl DirectoryArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            preserver: AttributePreserver,
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute() || crate::sandbox::has_parent_traversal(relative) {
            return Err(ShuttleError::InvalidArgument(format!("invalid archive key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }

    async fn copy_tree(&self, source: &Path, destination: &Path) -> Result<u64> {
        let mut bytes = 0;
        for entry in DirectoryScanner.files(source)? {
            bytes += self
                .preserver
                .copy_file(&entry.path, &destination.join(&entry.relative_path))
                .await?;
        }
        Ok(bytes)
    }
}

impl ArchiveStore for DirectoryArchiveStore {
    async fn archive(&self, server_id: &str, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .ok_or_else(|| ShuttleError::path_error(source, "nothing to archive"))?;

        let base = format!("{}/{}", server_id, archive_stamp(Utc::now()));
        let mut key = base.clone();
        let mut attempt = 0;
        while tokio::fs::try_exists(self.root.join(&key)).await? {
            attempt += 1;
            key = format!("{}_{}", base, attempt);
        }

        let snapshot = self.root.join(&key);
        let destination = if source.is_dir() { snapshot.join(name) } else { snapshot.clone() };
        tokio::fs::create_dir_all(&destination).await?;
        let bytes = self.copy_tree(source, &destination).await?;

        info!(key = %key, bytes, "archived snapshot");
        Ok(key)
    }

    async fn list(&self, server_id: &str) -> Result<Vec<String>> {
        let dir = self.key_path(server_id)?;
        let mut read = match tokio::fs::read_dir(&dir).await {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                keys.push(format!("{}/{}", server_id, entry.file_name().to_string_lossy()));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn restore(&self, key: &str, destination: &Path) -> Result<u64> {
        let snapshot = self.key_path(key)?;
        if !tokio::fs::try_exists(&snapshot).await? {
            return Err(ShuttleError::path_error(&snapshot, "no such archive snapshot"));
        }
        debug!(key, destination = %destination.display(), "restoring snapshot");
        self.copy_tree(&snapshot, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_archive_list_restore() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("docs");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("a.txt"), b"alpha").unwrap();
        std::fs::write(source.join("nested/b.txt"), b"bravo").unwrap();

        let store = DirectoryArchiveStore::new(temp_dir.path().join("store"));
        let first = store.archive("web-01", &source).await.unwrap();
        let second = store.archive("web-01", &source).await.unwrap();
        assert_ne!(first, second);

        let keys = store.list("web-01").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(store.list("other").await.unwrap().is_empty());

        let restored = temp_dir.path().join("restored");
        let bytes = store.restore(&first, &restored).await.unwrap();
        assert_eq!(bytes, 10);
        assert_eq!(std::fs::read(restored.join("docs/nested/b.txt")).unwrap(), b"bravo");
    }

    #[tokio::test]
    async fn test_archive_single_file_and_bad_key() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("note.txt");
        std::fs::write(&file, b"hi").unwrap();

        let store = DirectoryArchiveStore::new(temp_dir.path().join("store"));
        let key = store.archive("web-01", &file).await.unwrap();
        assert!(temp_dir.path().join("store").join(&key).join("note.txt").is_file());

        let result = store.restore("../escape", temp_dir.path()).await;
        assert!(matches!(result, Err(ShuttleError::InvalidArgument(_))));
    }
}
