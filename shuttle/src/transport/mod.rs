//! Narrow copy interface over the tools that actually move bytes
//!
//! [`Transport`] is everything the transfer engine needs from a backend: a tool
//! check, a connectivity probe, remote directory creation and a non-deleting copy.
//! [`RsyncTransport`] drives `rsync` over `ssh`; [`NativeTransport`] copies in
//! process for peers whose filesystem is reachable locally.

pub mod native;
pub mod rsync;

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::{Settings, TransportKind};
use crate::error::Result;
use crate::registry::ServerProfile;

pub use native::NativeTransport;
pub use rsync::RsyncTransport;

/// One side of a copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    /// Absolute path on the request's peer
    Remote(String),
}

impl Endpoint {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Whether a directory source is copied as itself or as its contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// `src` lands as `dst/<name of src>`
    Entry,
    /// The children of `src` land directly in `dst`
    Contents,
}

/// What to do with a destination file that differs from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    SkipExisting,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub dry_run: bool,
    pub overwrite: Overwrite,
    /// Destination-side directory that receives replaced files
    pub backup_dir: Option<String>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            overwrite: Overwrite::SkipExisting,
            backup_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyRequest<'a> {
    /// Required when either endpoint is remote
    pub peer: Option<&'a ServerProfile>,
    pub source: Endpoint,
    pub mode: SourceMode,
    /// Always a directory
    pub destination: Endpoint,
    pub options: CopyOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    /// Replaced an existing file with different content
    Updated,
    Directory,
}

/// One itemized change, relative to the destination directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyExit {
    Complete,
    /// Everything present was copied but some source entries disappeared mid-run
    SourceVanished,
}

#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub items: Vec<ItemChange>,
    pub bytes_transferred: u64,
    pub exit: CopyExit,
}

impl CopyOutcome {
    /// Items that replace existing content
    pub fn collisions(&self) -> impl Iterator<Item = &ItemChange> {
        self.items.iter().filter(|item| item.kind == ChangeKind::Updated)
    }

    /// Files written or to be written
    pub fn files(&self) -> impl Iterator<Item = &ItemChange> {
        self.items.iter().filter(|item| item.kind != ChangeKind::Directory)
    }
}

/// A backend able to move files between this machine and a peer
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Fail with `ToolMissing` if an external program is unavailable
    fn check_tools(&self) -> Result<()>;

    /// Cheap reachability check, bounded by `timeout`
    async fn probe(&self, peer: &ServerProfile, timeout: Duration) -> Result<()>;

    /// `mkdir -p` on the peer
    async fn ensure_remote_dir(&self, peer: &ServerProfile, path: &str) -> Result<()>;

    /// Copy without ever deleting at the destination
    async fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome>;
}

/// Backend picked from the `transport` setting
#[derive(Debug, Clone)]
pub enum Backend {
    Rsync(RsyncTransport),
    Native(NativeTransport),
}

impl Backend {
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.transport {
            TransportKind::Rsync => Self::Rsync(RsyncTransport::new(settings.connect_timeout())),
            TransportKind::Native => Self::Native(NativeTransport::new(&settings.native_mount)),
        }
    }
}

impl Transport for Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Rsync(t) => t.name(),
            Self::Native(t) => t.name(),
        }
    }

    fn check_tools(&self) -> Result<()> {
        match self {
            Self::Rsync(t) => t.check_tools(),
            Self::Native(t) => t.check_tools(),
        }
    }

    async fn probe(&self, peer: &ServerProfile, timeout: Duration) -> Result<()> {
        match self {
            Self::Rsync(t) => t.probe(peer, timeout).await,
            Self::Native(t) => t.probe(peer, timeout).await,
        }
    }

    async fn ensure_remote_dir(&self, peer: &ServerProfile, path: &str) -> Result<()> {
        match self {
            Self::Rsync(t) => t.ensure_remote_dir(peer, path).await,
            Self::Native(t) => t.ensure_remote_dir(peer, path).await,
        }
    }

    async fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome> {
        match self {
            Self::Rsync(t) => t.copy(request).await,
            Self::Native(t) => t.copy(request).await,
        }
    }
}

/// Absolute form of a source path, with trailing separators and `.` segments gone.
///
/// A trailing separator turns "copy this directory" into "copy its contents",
/// which drops the directory name at the destination, and `.` or `./` has no name
/// at all. A path still holding `..` is canonicalized when it exists, so the last
/// component is always the entry's real name. Every source goes through here once
/// before any other use.
pub fn normalize_source(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let normalized: PathBuf = absolute
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if normalized.components().any(|c| c == Component::ParentDir) {
        if let Ok(canonical) = std::fs::canonicalize(&normalized) {
            return canonical;
        }
    }
    normalized
}

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Last few lines of a tool's stderr
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("; ")
}
