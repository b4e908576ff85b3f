//! In-process copy for peers whose filesystem is mounted locally
//!
//! A peer's absolute remote path `/x/y` maps to `<mount>/x/y`. Files whose size
//! and modification second match are left alone, which gives the same quick-check
//! behaviour as rsync. Nothing at the destination is ever deleted.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;
use tracing::{debug, instrument, warn};

use super::{ChangeKind, CopyExit, CopyOutcome, CopyRequest, Endpoint, ItemChange, Overwrite, SourceMode, Transport};
use crate::error::{Result, ShuttleError};
use crate::preservation::AttributePreserver;
use crate::registry::ServerProfile;
use crate::scanner::{DirectoryScanner, FileEntry};

const NATIVE: &str = "native";

/// Exit status reported for copies that fail outright, matching rsync's "partial transfer"
const PARTIAL_TRANSFER: i32 = 23;

#[derive(Debug, Clone)]
pub struct NativeTransport {
    mount: PathBuf,
    preserver: AttributePreserver,
    scanner: DirectoryScanner,
}

impl NativeTransport {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            preserver: AttributePreserver,
            scanner: DirectoryScanner,
        }
    }

    /// Local location of a path on a peer
    pub fn map_remote(&self, remote: &str) -> PathBuf {
        self.mount.join(remote.trim_start_matches('/'))
    }

    fn local_path(&self, endpoint: &Endpoint) -> PathBuf {
        match endpoint {
            Endpoint::Local(path) => path.clone(),
            Endpoint::Remote(path) => self.map_remote(path),
        }
    }

    /// Entries to copy, each paired with its path relative to the destination
    fn plan(&self, source: &Path, mode: SourceMode) -> Result<Vec<(PathBuf, FileEntry)>> {
        let metadata = std::fs::metadata(source).map_err(|e| {
            ShuttleError::transfer_error(NATIVE, PARTIAL_TRANSFER, format!("cannot read '{}': {}", source.display(), e))
        })?;

        let entries = self.scanner.scan(source)?;
        if !metadata.is_dir() || mode == SourceMode::Contents {
            return Ok(entries.into_iter().map(|e| (e.relative_path.clone(), e)).collect());
        }

        let name = source
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| ShuttleError::path_error(source, "directory source has no name"))?;
        let root = FileEntry {
            path: source.to_path_buf(),
            relative_path: PathBuf::new(),
            size: 0,
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            is_dir: true,
            is_symlink: false,
            permissions: 0,
        };

        let mut planned = vec![(name.clone(), root)];
        planned.extend(entries.into_iter().map(|e| (name.join(&e.relative_path), e)));
        Ok(planned)
    }
}

impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        NATIVE
    }

    fn check_tools(&self) -> Result<()> {
        Ok(())
    }

    async fn probe(&self, peer: &ServerProfile, _timeout: Duration) -> Result<()> {
        if fs::metadata(&self.mount).await.map(|m| m.is_dir()).unwrap_or(false) {
            Ok(())
        } else {
            Err(ShuttleError::connectivity_error(
                &peer.host,
                format!("mount '{}' is not an accessible directory", self.mount.display()),
            ))
        }
    }

    async fn ensure_remote_dir(&self, _peer: &ServerProfile, path: &str) -> Result<()> {
        let local = self.map_remote(path);
        fs::create_dir_all(&local).await.map_err(|e| {
            ShuttleError::transfer_error(NATIVE, PARTIAL_TRANSFER, format!("cannot create '{}': {}", local.display(), e))
        })
    }

    #[instrument(skip(self, request), fields(dry_run = request.options.dry_run))]
    async fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome> {
        let source = self.local_path(&request.source);
        let destination = self.local_path(&request.destination);
        let backup_dir = request
            .options
            .backup_dir
            .as_ref()
            .map(|dir| match &request.destination {
                Endpoint::Remote(_) => self.map_remote(dir),
                Endpoint::Local(_) => PathBuf::from(dir),
            });
        let dry_run = request.options.dry_run;

        let mut items = Vec::new();
        let mut bytes_transferred = 0u64;
        let mut exit = CopyExit::Complete;

        for (relative, entry) in self.plan(&source, request.mode)? {
            let target = destination.join(&relative);

            if entry.is_dir {
                if fs::symlink_metadata(&target).await.is_err() {
                    items.push(ItemChange { path: relative, kind: ChangeKind::Directory, size: 0 });
                    if !dry_run {
                        fs::create_dir_all(&target).await?;
                    }
                }
                continue;
            }

            let kind = match fs::symlink_metadata(&target).await {
                Err(_) => ChangeKind::Created,
                Ok(existing) if entry.is_symlink && existing.file_type().is_symlink() => {
                    if same_link(&entry.path, &target).await {
                        continue;
                    }
                    ChangeKind::Updated
                }
                Ok(existing) if same_quick_check(&existing, &entry) => continue,
                Ok(_) if request.options.overwrite == Overwrite::SkipExisting => continue,
                Ok(_) => ChangeKind::Updated,
            };

            if !dry_run {
                if kind == ChangeKind::Updated {
                    if let Some(backup_dir) = &backup_dir {
                        let backup = backup_dir.join(&relative);
                        if let Some(parent) = backup.parent() {
                            fs::create_dir_all(parent).await?;
                        }
                        fs::rename(&target, &backup).await?;
                        debug!("backed up '{}' to '{}'", target.display(), backup.display());
                    }
                }

                match self.copy_entry(&entry, &target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound && !entry.path.exists() => {
                        warn!("source vanished during copy: {}", entry.path.display());
                        exit = CopyExit::SourceVanished;
                        continue;
                    }
                    Err(e) => {
                        return Err(ShuttleError::transfer_error(
                            NATIVE,
                            PARTIAL_TRANSFER,
                            format!("cannot copy '{}': {}", entry.path.display(), e),
                        ))
                    }
                }
            }

            bytes_transferred += entry.size;
            items.push(ItemChange { path: relative, kind, size: entry.size });
        }

        Ok(CopyOutcome {
            items,
            bytes_transferred,
            exit,
        })
    }
}

impl NativeTransport {
    async fn copy_entry(&self, entry: &FileEntry, target: &Path) -> std::io::Result<()> {
        if entry.is_symlink {
            return copy_symlink(&entry.path, target).await;
        }
        self.preserver
            .copy_file(&entry.path, target)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ShuttleError::Io(io) => io,
                other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            })
    }
}

#[cfg(unix)]
async fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    let link = fs::read_link(source).await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::symlink_metadata(target).await.is_ok() {
        fs::remove_file(target).await?;
    }
    fs::symlink(link, target).await
}

#[cfg(not(unix))]
async fn copy_symlink(source: &Path, _target: &Path) -> std::io::Result<()> {
    warn!("skipping symlink '{}': not supported on this platform", source.display());
    Ok(())
}

async fn same_link(source: &Path, target: &Path) -> bool {
    match (fs::read_link(source).await, fs::read_link(target).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Same size and same modification second
fn same_quick_check(existing: &std::fs::Metadata, entry: &FileEntry) -> bool {
    if existing.is_dir() || existing.len() != entry.size {
        return false;
    }
    let seconds = |t: SystemTime| t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    existing
        .modified()
        .map(|m| seconds(m) == seconds(entry.modified))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CopyOptions;
    use tempfile::TempDir;

    fn peer() -> ServerProfile {
        ServerProfile {
            id: "peer-a".to_string(),
            name: "peer".to_string(),
            host: "localhost".to_string(),
            port: 22,
            user: "alice".to_string(),
            identity_file: None,
            remote_root: "/srv/peer-a".to_string(),
            enabled: true,
            archive_store: false,
        }
    }

    fn tree(root: &Path) {
        std::fs::create_dir_all(root.join("foo/sub")).unwrap();
        std::fs::write(root.join("foo/a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("foo/sub/b.txt"), b"bravo!").unwrap();
    }

    #[tokio::test]
    async fn test_entry_mode_keeps_directory_name() {
        let temp_dir = TempDir::new().unwrap();
        tree(temp_dir.path());
        let transport = NativeTransport::new(temp_dir.path().join("mount"));
        let profile = peer();

        let request = CopyRequest {
            peer: Some(&profile),
            source: Endpoint::Local(temp_dir.path().join("foo")),
            mode: SourceMode::Entry,
            destination: Endpoint::Remote("/srv/peer-a/inbox".to_string()),
            options: CopyOptions::default(),
        };
        let outcome = transport.copy(&request).await.unwrap();

        let landed = temp_dir.path().join("mount/srv/peer-a/inbox/foo");
        assert_eq!(std::fs::read(landed.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(landed.join("sub/b.txt")).unwrap(), b"bravo!");
        assert_eq!(outcome.bytes_transferred, 11);
        assert_eq!(outcome.files().count(), 2);
        assert_eq!(outcome.exit, CopyExit::Complete);
    }

    #[tokio::test]
    async fn test_second_copy_is_a_no_op() {
        let temp_dir = TempDir::new().unwrap();
        tree(temp_dir.path());
        let transport = NativeTransport::new(temp_dir.path().join("mount"));
        let request = CopyRequest {
            peer: None,
            source: Endpoint::Local(temp_dir.path().join("foo")),
            mode: SourceMode::Contents,
            destination: Endpoint::Local(temp_dir.path().join("copy")),
            options: CopyOptions { overwrite: Overwrite::Replace, ..Default::default() },
        };

        transport.copy(&request).await.unwrap();
        let again = transport.copy(&request).await.unwrap();
        assert!(again.items.is_empty());
        assert_eq!(again.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn test_changed_file_is_update_with_backup() {
        let temp_dir = TempDir::new().unwrap();
        tree(temp_dir.path());
        let dest = temp_dir.path().join("copy");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("a.txt"), b"older content").unwrap();

        let transport = NativeTransport::new(temp_dir.path().join("mount"));
        let mut request = CopyRequest {
            peer: None,
            source: Endpoint::Local(temp_dir.path().join("foo")),
            mode: SourceMode::Contents,
            destination: Endpoint::Local(dest.clone()),
            options: CopyOptions::default(),
        };

        let skipped = transport.copy(&request).await.unwrap();
        assert_eq!(skipped.collisions().count(), 0);
        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"older content");

        request.options = CopyOptions {
            dry_run: false,
            overwrite: Overwrite::Replace,
            backup_dir: Some(temp_dir.path().join("backup").to_string_lossy().into_owned()),
        };
        let replaced = transport.copy(&request).await.unwrap();
        assert_eq!(replaced.collisions().count(), 1);
        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(temp_dir.path().join("backup/a.txt")).unwrap(), b"older content");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        tree(temp_dir.path());
        let transport = NativeTransport::new(temp_dir.path().join("mount"));
        let request = CopyRequest {
            peer: None,
            source: Endpoint::Local(temp_dir.path().join("foo")),
            mode: SourceMode::Entry,
            destination: Endpoint::Local(temp_dir.path().join("copy")),
            options: CopyOptions { dry_run: true, ..Default::default() },
        };

        let plan = transport.copy(&request).await.unwrap();
        assert_eq!(plan.files().count(), 2);
        assert!(!temp_dir.path().join("copy").exists());
    }

    #[tokio::test]
    async fn test_connectivity_check_requires_mount() {
        let temp_dir = TempDir::new().unwrap();
        let transport = NativeTransport::new(temp_dir.path().join("missing"));
        let result = transport.probe(&peer(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ShuttleError::Connectivity { .. })));
    }
}
