//! On-disk layout under the sandbox root, local and remote

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, ShuttleError};

/// Share target name that is never a server id
pub const GLOBAL_TARGET: &str = "global";

/// File name of the configuration inside `config/`
pub const CONFIG_FILE_NAME: &str = "sync-shuttle.toml";

/// `chrono` format of the timestamp directories under `archive/`
pub const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Archive directory name for a moment in time
pub fn archive_stamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format(ARCHIVE_STAMP_FORMAT).to_string()
}

/// Directory names under the sandbox root
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    root: PathBuf,
}

impl SandboxLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn remote_dir(&self, server_id: &str) -> PathBuf {
        self.root.join("remote").join(server_id)
    }

    /// Transient per-operation staging area for a push
    pub fn staging_dir(&self, server_id: &str, operation_id: Uuid) -> PathBuf {
        self.remote_dir(server_id)
            .join(format!("push-{}", operation_id.hyphenated()))
    }

    pub fn inbox_root(&self) -> PathBuf {
        self.root.join("local").join("inbox")
    }

    /// Durable destination for files pulled from `server_id`
    pub fn inbox_dir(&self, server_id: &str) -> PathBuf {
        self.inbox_root().join(server_id)
    }

    pub fn outbox_root(&self) -> PathBuf {
        self.root.join("local").join("outbox")
    }

    /// Share target directory: a server id or [`GLOBAL_TARGET`]
    pub fn outbox_dir(&self, target: &str) -> PathBuf {
        self.outbox_root().join(target)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn human_log(&self) -> PathBuf {
        self.logs_dir().join("sync.log")
    }

    pub fn structured_log(&self) -> PathBuf {
        self.logs_dir().join("sync.jsonl")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    /// Lock file guarding archive retention cleanup
    pub fn archive_lock(&self) -> PathBuf {
        self.archive_dir().join(".retention.lock")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create the standard tree. Existing directories are left alone.
    pub async fn ensure(&self) -> Result<()> {
        for dir in [
            self.config_dir(),
            self.root.join("remote"),
            self.inbox_root(),
            self.outbox_root(),
            self.logs_dir(),
            self.archive_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ShuttleError::path_error(&dir, format!("Failed to create directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// Remove everything inside `tmp/`
    pub async fn clear_tmp(&self) -> Result<()> {
        let tmp = self.tmp_dir();
        let mut entries = match fs::read_dir(&tmp).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

/// Paths on a peer, all relative to its remote root
pub mod remote {
    /// Where pushes from `local_name` land on the peer
    pub fn inbox_for(remote_root: &str, local_name: &str) -> String {
        format!("{}/local/inbox/{}", remote_root.trim_end_matches('/'), local_name)
    }

    /// What a pull copies from the peer
    pub fn outbox(remote_root: &str) -> String {
        format!("{}/local/outbox", remote_root.trim_end_matches('/'))
    }

    /// Backup directory for a forced overwrite on the peer
    pub fn archive(remote_root: &str, stamp: &str) -> String {
        format!("{}/archive/{}", remote_root.trim_end_matches('/'), stamp)
    }
}
