//! Advisory lock file and archive retention cleanup
//!
//! The lock is best-effort and not reentrant: `create_new` either wins or sees a
//! holder. A lock older than the stale window is assumed to belong to a crashed
//! process and is broken once.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, ShuttleError};
use crate::layout::{SandboxLayout, ARCHIVE_STAMP_FORMAT};
use crate::scanner::total_size;

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self> {
        let path = path.into();
        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !is_stale(&path, stale_after) {
                    let holder = std::fs::read_to_string(&path).unwrap_or_default();
                    return Err(ShuttleError::lock_error(
                        &path,
                        format!("held by {}", holder.trim()),
                    ));
                }
                warn!(path = %path.display(), "breaking stale lock");
                std::fs::remove_file(&path)
                    .map_err(|e| ShuttleError::lock_error(&path, format!("cannot remove stale lock: {}", e)))?;
                Self::try_create(&path).map_err(|e| ShuttleError::lock_error(&path, e.to_string()))
            }
            Err(e) => Err(ShuttleError::lock_error(&path, e.to_string())),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())?;
        debug!(path = %path.display(), "lock acquired");
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to release lock: {}", e);
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

/// One `archive/<timestamp>/` directory
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveListing {
    pub stamp: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

/// Timestamp of an archive directory name, `_N` suffixes ignored
pub fn parse_stamp(name: &str) -> Option<NaiveDateTime> {
    let head = name.get(..15)?;
    NaiveDateTime::parse_from_str(head, ARCHIVE_STAMP_FORMAT).ok()
}

/// Archive directories, oldest first
pub fn list_archives(layout: &SandboxLayout) -> Result<Vec<ArchiveListing>> {
    let dir = layout.archive_dir();
    let read = match std::fs::read_dir(&dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut listings = Vec::new();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.file_type()?.is_dir() || parse_stamp(&name).is_none() {
            continue;
        }
        let path = entry.path();
        listings.push(ArchiveListing {
            bytes: total_size(&path)?,
            stamp: name,
            path,
        });
    }
    listings.sort_by(|a, b| a.stamp.cmp(&b.stamp));
    Ok(listings)
}

/// Remove archive directories older than `retention_days`, under the retention lock
pub fn prune_archives(layout: &SandboxLayout, retention_days: u32, stale_after: Duration) -> Result<PruneReport> {
    let _lock = LockFile::acquire(layout.archive_lock(), stale_after)?;
    let cutoff = Utc::now().naive_utc() - ChronoDuration::days(i64::from(retention_days));

    let mut report = PruneReport::default();
    for listing in list_archives(layout)? {
        match parse_stamp(&listing.stamp) {
            Some(stamp) if stamp < cutoff => {
                std::fs::remove_dir_all(&listing.path)?;
                info!(path = %listing.path.display(), "pruned archive");
                report.removed.push(listing.path);
            }
            _ => report.kept += 1,
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive/.retention.lock");

        let held = LockFile::acquire(&path, Duration::from_secs(300)).unwrap();
        let second = LockFile::acquire(&path, Duration::from_secs(300));
        assert!(matches!(second, Err(ShuttleError::Lock { .. })));

        drop(held);
        assert!(!path.exists());
        assert!(LockFile::acquire(&path, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("held.lock");
        std::fs::write(&path, "pid=1").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(old)).unwrap();

        let lock = LockFile::acquire(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(lock.path(), path);
    }

    #[test]
    fn test_parse_stamp() {
        assert!(parse_stamp("20240101_120000").is_some());
        assert!(parse_stamp("20240101_120000_2").is_some());
        assert!(parse_stamp(".retention.lock").is_none());
        assert!(parse_stamp("notes").is_none());
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let temp_dir = TempDir::new().unwrap();
        let layout = SandboxLayout::new(temp_dir.path());
        let old = layout.archive_dir().join("20000101_000000");
        let fresh = layout.archive_dir().join(crate::layout::archive_stamp(Utc::now()));
        for dir in [&old, &fresh] {
            std::fs::create_dir_all(dir).unwrap();
            std::fs::write(dir.join("file.txt"), b"data").unwrap();
        }
        std::fs::create_dir_all(layout.archive_dir().join("unrelated")).unwrap();

        let listed = list_archives(&layout).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].bytes, 4);

        let report = prune_archives(&layout, 30, Duration::from_secs(300)).unwrap();
        assert_eq!(report.removed, vec![old.clone()]);
        assert_eq!(report.kept, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(layout.archive_dir().join("unrelated").exists());
        assert!(!layout.archive_lock().exists());
    }
}
