//! Refuse-unless-forced handling of destinations that already have content
//!
//! A collision is resolved in one of three ways: rejected (no `--force`),
//! declined (interactive prompt answered with no), or archived and allowed.
//! Archival is always a copy into `archive/<timestamp>/<relative path>`, taken
//! before the transfer overwrites the original.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, ShuttleError};
use crate::layout::archive_stamp;
use crate::ledger::{LogLevel, OperationLedger};
use crate::preservation::AttributePreserver;
use crate::sandbox::PathSandbox;

/// Size and modification time shown when asking about an overwrite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileSummary {
    pub fn new(size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            size,
            modified: modified.map(DateTime::<Utc>::from),
        }
    }

    /// Summary of an existing local file
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            ShuttleError::path_error(path, format!("Failed to read metadata: {}", e))
        })?;
        Ok(Self::new(metadata.len(), metadata.modified().ok()))
    }
}

impl std::fmt::Display for FileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.modified {
            Some(modified) => write!(f, "{} bytes, modified {}", self.size, modified.format("%Y-%m-%d %H:%M:%S UTC")),
            None => write!(f, "{} bytes", self.size),
        }
    }
}

/// What the user is asked to approve
#[derive(Debug, Clone, Serialize)]
pub struct OverwritePrompt {
    pub path: PathBuf,
    /// Unknown when the destination lives on a peer
    pub existing: Option<FileSummary>,
    pub incoming: Option<FileSummary>,
}

/// Source of overwrite confirmations
pub trait Confirm {
    /// Whether a person can answer prompts
    fn is_interactive(&self) -> bool;

    /// Ask whether `prompt.path` may be overwritten
    fn confirm_overwrite(&self, prompt: &OverwritePrompt) -> bool;
}

/// No terminal attached: `--force` is the consent
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Confirm for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm_overwrite(&self, _prompt: &OverwritePrompt) -> bool {
        true
    }
}

/// Outcome of a permitted write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proceed {
    /// Nothing at the destination
    Clear,
    /// Existing content copied to this archive entry
    Archived(PathBuf),
    /// Dry run: this archive entry would have been written
    WouldArchive(PathBuf),
}

/// Collision decisions for one operation
pub struct CollisionPolicy<'a> {
    sandbox: &'a PathSandbox,
    ledger: &'a OperationLedger,
    confirm: &'a dyn Confirm,
    archive_root: PathBuf,
    stamp: String,
    preserver: AttributePreserver,
}

impl<'a> CollisionPolicy<'a> {
    /// `archive_root` is the sandbox's `archive/` directory. The timestamp is fixed
    /// here so every file archived by one operation lands in the same directory.
    pub fn new(
        sandbox: &'a PathSandbox,
        ledger: &'a OperationLedger,
        confirm: &'a dyn Confirm,
        archive_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sandbox,
            ledger,
            confirm,
            archive_root: archive_root.into(),
            stamp: archive_stamp(Utc::now()),
            preserver: AttributePreserver,
        }
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Decide whether `destination` may be written, archiving what is there first.
    ///
    /// `relative` names the file under the archive stamp directory. Directories never
    /// collide: copying into an existing directory merges and replaces nothing itself.
    pub async fn check_and_prepare(
        &self,
        destination: &Path,
        relative: &Path,
        incoming: Option<FileSummary>,
        force: bool,
        dry_run: bool,
    ) -> Result<Proceed> {
        let destination = self.sandbox.validate(destination)?;
        let metadata = match std::fs::symlink_metadata(&destination) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Proceed::Clear),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Ok(Proceed::Clear);
        }

        let existing = FileSummary::new(metadata.len(), metadata.modified().ok());
        self.authorize(&destination, Some(existing), incoming, force)?;

        let target = self.archive_target(relative)?;
        if dry_run {
            info!("DRY RUN: would archive '{}' to '{}'", destination.display(), target.display());
            return Ok(Proceed::WouldArchive(target));
        }

        self.preserver.copy_file(&destination, &target).await?;
        self.ledger.append(
            LogLevel::Info,
            &format!("archived '{}' to '{}'", destination.display(), target.display()),
        )?;
        Ok(Proceed::Archived(target))
    }

    /// Same decision for a destination on a peer. The copy on the peer is made
    /// by the transfer tool's backup directory, not here.
    pub fn authorize_remote(&self, destination: &str, incoming: Option<FileSummary>, force: bool) -> Result<()> {
        self.authorize(Path::new(destination), None, incoming, force)
    }

    fn authorize(
        &self,
        destination: &Path,
        existing: Option<FileSummary>,
        incoming: Option<FileSummary>,
        force: bool,
    ) -> Result<()> {
        if !force {
            debug!(path = %destination.display(), "collision without force");
            return Err(ShuttleError::Collision {
                path: destination.to_path_buf(),
            });
        }

        if self.confirm.is_interactive() {
            let prompt = OverwritePrompt {
                path: destination.to_path_buf(),
                existing,
                incoming,
            };
            if !self.confirm.confirm_overwrite(&prompt) {
                return Err(ShuttleError::Declined {
                    path: destination.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    /// `archive/<stamp>/<relative>`, with `_1`, `_2`, ... appended to the stamp
    /// when an earlier operation in the same second already used the name.
    fn archive_target(&self, relative: &Path) -> Result<PathBuf> {
        let mut stamp = self.stamp.clone();
        let mut attempt = 0u32;
        loop {
            let candidate = self.sandbox.join(&self.archive_root.join(&stamp), relative)?;
            if std::fs::symlink_metadata(&candidate).is_err() {
                return Ok(candidate);
            }
            attempt += 1;
            stamp = format!("{}_{}", self.stamp, attempt);
        }
    }
}
