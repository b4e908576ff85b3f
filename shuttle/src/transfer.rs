//! Staged push, direct pull, and local share
//!
//! A push first copies the source into a per-operation staging directory under
//! `remote/<server>/push-<uuid>`, then relays the staging contents to the peer's
//! inbox for this machine. The staging directory is removed whether the push
//! succeeds, fails or is a dry run; a dry run never contacts the peer it pushes to.
//! A pull copies the peer's outbox straight into
//! `local/inbox/<server>`, which is already the durable destination.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::collision::{CollisionPolicy, Confirm, FileSummary, Proceed};
use crate::context::ShuttleContext;
use crate::error::{Result, ShuttleError};
use crate::layout::{archive_stamp, remote};
use crate::ledger::{LogLevel, OperationFlags, OperationLedger};
use crate::preservation::AttributePreserver;
use crate::registry::ServerProfile;
use crate::scanner::{total_size, DirectoryScanner};
use crate::transport::{
    normalize_source, ChangeKind, CopyExit, CopyOptions, CopyOutcome, CopyRequest, Endpoint, ItemChange,
    Overwrite, SourceMode, Transport,
};

/// Result of one push, pull or share
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferOutcome {
    /// Where the data went, as recorded in the ledger
    pub destination: String,
    /// Files written (or planned, on a dry run), relative to `destination`
    pub files: Vec<PathBuf>,
    /// Bytes moved; on a dry run, bytes that would have moved
    pub bytes_transferred: u64,
    /// Archive entries or peer-side backup directories made for overwrites
    pub archived: Vec<String>,
    /// Some source entries disappeared mid-run and that was accepted
    pub vanished: bool,
    pub dry_run: bool,
    /// The itemized changes behind `files`, with sizes
    #[serde(skip)]
    pub items: Vec<ItemChange>,
}

/// Transient staging directory, removed on drop
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    /// Create `remote/<server>/push-<uuid>` after validating it against the sandbox
    pub async fn create(ctx: &ShuttleContext, server_id: &str, operation: Uuid) -> Result<Self> {
        let parent = ctx.layout.remote_dir(server_id);
        fs::create_dir_all(&parent).await.map_err(|e| {
            ShuttleError::path_error(&parent, format!("Failed to create directory: {}", e))
        })?;

        let path = ctx.sandbox.validate(ctx.layout.staging_dir(server_id, operation))?;
        fs::create_dir(&path).await.map_err(|e| {
            ShuttleError::path_error(&path, format!("Failed to create staging area: {}", e))
        })?;
        debug!(path = %path.display(), "staging area created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staging area removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove staging area: {}", e),
        }
    }
}

/// Check that a push or share source exists, is readable and fits under `limit`.
///
/// Returns the normalized source path. A symlinked source is followed one level.
pub fn preflight_source(source: &Path, limit: u64) -> Result<PathBuf> {
    let source = normalize_source(source);
    if source.as_os_str().is_empty() {
        return Err(ShuttleError::InvalidArgument("source path is empty".to_string()));
    }

    let metadata = std::fs::symlink_metadata(&source)
        .map_err(|_| ShuttleError::preflight_error(&source, "source does not exist"))?;
    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(&source)
            .map_err(|e| ShuttleError::preflight_error(&source, format!("cannot read link: {}", e)))?;
        let target = match source.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        if std::fs::metadata(&target).is_err() {
            return Err(ShuttleError::preflight_error(
                &source,
                format!("symlink target '{}' does not exist", target.display()),
            ));
        }
    }

    let readable = if source.is_dir() {
        std::fs::read_dir(&source).map(|_| ())
    } else {
        std::fs::File::open(&source).map(|_| ())
    };
    readable.map_err(|e| ShuttleError::preflight_error(&source, format!("source is not readable: {}", e)))?;

    let size = total_size(&source)?;
    if size > limit {
        return Err(ShuttleError::Oversize { path: source, size, limit });
    }
    debug!(source = %source.display(), size, "preflight passed");
    Ok(source)
}

/// Runs pushes and pulls through a [`Transport`]
pub struct TransferEngine<'a, T: Transport> {
    ctx: &'a ShuttleContext,
    transport: &'a T,
    ledger: &'a OperationLedger,
    confirm: &'a dyn Confirm,
    preserver: AttributePreserver,
}

impl<'a, T: Transport> TransferEngine<'a, T> {
    pub fn new(
        ctx: &'a ShuttleContext,
        transport: &'a T,
        ledger: &'a OperationLedger,
        confirm: &'a dyn Confirm,
    ) -> Self {
        Self {
            ctx,
            transport,
            ledger,
            confirm,
            preserver: AttributePreserver,
        }
    }

    fn policy(&self) -> CollisionPolicy<'_> {
        CollisionPolicy::new(&self.ctx.sandbox, self.ledger, self.confirm, self.ctx.layout.archive_dir())
    }

    /// Push `source` to the peer's inbox for this machine
    #[instrument(skip(self, profile, flags), fields(server = %profile.id))]
    pub async fn push(
        &self,
        operation: Uuid,
        source: &Path,
        profile: &ServerProfile,
        flags: OperationFlags,
    ) -> Result<TransferOutcome> {
        let source = preflight_source(source, self.ctx.settings.max_transfer_bytes)?;
        let staging = StagingArea::create(self.ctx, &profile.id, operation).await?;

        let staged = self
            .transport
            .copy(&CopyRequest {
                peer: None,
                source: Endpoint::Local(source),
                mode: SourceMode::Entry,
                destination: Endpoint::Local(staging.path().to_path_buf()),
                options: CopyOptions {
                    dry_run: flags.dry_run,
                    ..Default::default()
                },
            })
            .await?;

        self.relay_staging(&staging, staged, profile, flags).await
    }

    /// Push `files` (relative to `base`, which must be inside the sandbox) to a peer,
    /// keeping their relative layout.
    ///
    /// On a dry run, `arriving` lists files a dry-run pull would have delivered into
    /// `base`; they are planned with their announced sizes since they are not here yet.
    #[instrument(skip(self, files, arriving, profile, flags), fields(server = %profile.id, count = files.len()))]
    pub async fn push_files(
        &self,
        operation: Uuid,
        base: &Path,
        files: &[PathBuf],
        arriving: &[ItemChange],
        profile: &ServerProfile,
        flags: OperationFlags,
    ) -> Result<TransferOutcome> {
        let mut sources = Vec::with_capacity(files.len());
        let mut size = 0u64;
        for relative in files {
            let path = self.ctx.sandbox.join(base, relative)?;
            let announced = arriving.iter().find(|item| &item.path == relative).filter(|_| flags.dry_run);
            let len = match announced {
                Some(item) => item.size,
                None => existing_len(&path).await?,
            };
            size = size.saturating_add(len);
            sources.push((relative.clone(), path, len));
        }
        let limit = self.ctx.settings.max_transfer_bytes;
        if size > limit {
            return Err(ShuttleError::Oversize { path: base.to_path_buf(), size, limit });
        }

        let staging = StagingArea::create(self.ctx, &profile.id, operation).await?;
        let mut staged = CopyOutcome {
            items: Vec::new(),
            bytes_transferred: 0,
            exit: CopyExit::Complete,
        };
        for (relative, path, len) in sources {
            if !flags.dry_run {
                let target = self.ctx.sandbox.join(staging.path(), &relative)?;
                self.preserver.copy_file(&path, &target).await?;
            }
            staged.bytes_transferred += len;
            staged.items.push(ItemChange {
                path: relative,
                kind: ChangeKind::Created,
                size: len,
            });
        }

        self.relay_staging(&staging, staged, profile, flags).await
    }

    /// Second phase of a push: staging contents to the peer
    async fn relay_staging(
        &self,
        staging: &StagingArea,
        staged: CopyOutcome,
        profile: &ServerProfile,
        flags: OperationFlags,
    ) -> Result<TransferOutcome> {
        let inbox = remote::inbox_for(&profile.remote_root, &self.ctx.local_name);
        let destination = format!("{}:{}", profile.destination(), inbox);

        if flags.dry_run {
            let vanished = self.accept_exit(&staged)?;
            info!(
                "DRY RUN: would push {} file(s), {} bytes to {}",
                staged.files().count(),
                staged.bytes_transferred,
                destination
            );
            return Ok(TransferOutcome {
                destination,
                files: staged.files().map(|item| item.path.clone()).collect(),
                bytes_transferred: staged.bytes_transferred,
                archived: Vec::new(),
                vanished,
                dry_run: true,
                items: staged.items,
            });
        }

        self.transport.probe(profile, self.ctx.settings.connect_timeout()).await?;
        self.transport.ensure_remote_dir(profile, &inbox).await?;

        let request = |options: CopyOptions| CopyRequest {
            peer: Some(profile),
            source: Endpoint::Local(staging.path().to_path_buf()),
            mode: SourceMode::Contents,
            destination: Endpoint::Remote(inbox.clone()),
            options,
        };

        let plan = self
            .transport
            .copy(&request(CopyOptions {
                dry_run: true,
                overwrite: Overwrite::Replace,
                backup_dir: None,
            }))
            .await?;

        let policy = self.policy();
        let mut archived = Vec::new();
        let mut options = CopyOptions::default();
        for collision in plan.collisions() {
            let remote_path = format!("{}/{}", inbox, collision.path.display());
            policy.authorize_remote(&remote_path, Some(FileSummary::new(collision.size, None)), flags.force)?;
        }
        if plan.collisions().next().is_some() {
            let backup_dir = remote::archive(&profile.remote_root, &archive_stamp(Utc::now()));
            self.ledger.append(
                LogLevel::Info,
                &format!(
                    "overwriting {} file(s) on {}; previous versions kept in {}",
                    plan.collisions().count(),
                    profile.id,
                    backup_dir
                ),
            )?;
            archived.push(backup_dir.clone());
            options.overwrite = Overwrite::Replace;
            options.backup_dir = Some(backup_dir);
        }

        let sent = self.transport.copy(&request(options)).await?;
        let vanished = self.accept_exit(&staged)? | self.accept_exit(&sent)?;

        Ok(TransferOutcome {
            destination,
            files: sent.files().map(|item| item.path.clone()).collect(),
            bytes_transferred: sent.bytes_transferred,
            archived,
            vanished,
            dry_run: false,
            items: sent.items,
        })
    }

    /// Pull the peer's outbox into `destination` (default `local/inbox/<server>`)
    #[instrument(skip(self, profile, destination, flags), fields(server = %profile.id))]
    pub async fn pull(
        &self,
        profile: &ServerProfile,
        destination: Option<&Path>,
        flags: OperationFlags,
    ) -> Result<TransferOutcome> {
        let destination = match destination {
            Some(path) => self.ctx.sandbox.validate(path)?,
            None => self.ctx.sandbox.validate(self.ctx.layout.inbox_dir(&profile.id))?,
        };
        if !flags.dry_run {
            fs::create_dir_all(&destination).await.map_err(|e| {
                ShuttleError::path_error(&destination, format!("Failed to create directory: {}", e))
            })?;
        }

        self.transport.probe(profile, self.ctx.settings.connect_timeout()).await?;
        let outbox = remote::outbox(&profile.remote_root);
        self.transport.ensure_remote_dir(profile, &outbox).await?;

        let request = |options: CopyOptions| CopyRequest {
            peer: Some(profile),
            source: Endpoint::Remote(outbox.clone()),
            mode: SourceMode::Contents,
            destination: Endpoint::Local(destination.clone()),
            options,
        };

        let plan = self
            .transport
            .copy(&request(CopyOptions {
                dry_run: true,
                overwrite: Overwrite::Replace,
                backup_dir: None,
            }))
            .await?;

        let policy = self.policy();
        let mut archived = Vec::new();
        for collision in plan.collisions() {
            let local = self.ctx.sandbox.join(&destination, &collision.path)?;
            let relative = self.ctx.sandbox.relative(&local)?;
            let incoming = Some(FileSummary::new(collision.size, None));
            match policy.check_and_prepare(&local, &relative, incoming, flags.force, flags.dry_run).await? {
                Proceed::Archived(path) | Proceed::WouldArchive(path) => archived.push(path.display().to_string()),
                Proceed::Clear => {}
            }
        }

        let destination_label = destination.display().to_string();
        if flags.dry_run {
            info!(
                "DRY RUN: would pull {} file(s), {} bytes into {}",
                plan.files().count(),
                plan.bytes_transferred,
                destination_label
            );
            return Ok(TransferOutcome {
                destination: destination_label,
                files: plan.files().map(|item| item.path.clone()).collect(),
                bytes_transferred: plan.bytes_transferred,
                archived,
                vanished: false,
                dry_run: true,
                items: plan.items,
            });
        }

        let overwrite = if archived.is_empty() { Overwrite::SkipExisting } else { Overwrite::Replace };
        let received = self
            .transport
            .copy(&request(CopyOptions {
                dry_run: false,
                overwrite,
                backup_dir: None,
            }))
            .await?;
        let vanished = self.accept_exit(&received)?;

        Ok(TransferOutcome {
            destination: destination_label,
            files: received.files().map(|item| item.path.clone()).collect(),
            bytes_transferred: received.bytes_transferred,
            archived,
            vanished,
            dry_run: false,
            items: received.items,
        })
    }

    /// Copy `source` into the outbox directory `target_dir` for peers to pull
    #[instrument(skip(self, source, target_dir, flags))]
    pub async fn share(&self, source: &Path, target_dir: &Path, flags: OperationFlags) -> Result<TransferOutcome> {
        let source = preflight_source(source, self.ctx.settings.max_transfer_bytes)?;
        let target_dir = self.ctx.sandbox.validate(target_dir)?;
        let name = source
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| ShuttleError::InvalidArgument(format!("cannot share '{}'", source.display())))?;

        let policy = self.policy();
        let mut outcome = TransferOutcome {
            destination: target_dir.display().to_string(),
            dry_run: flags.dry_run,
            ..Default::default()
        };

        let entries = DirectoryScanner.files(&source)?;
        for entry in entries {
            let relative = if source.is_dir() { name.join(&entry.relative_path) } else { name.clone() };
            let target = self.ctx.sandbox.join(&target_dir, &relative)?;

            if let Ok(existing) = fs::metadata(&target).await {
                let unchanged = existing.len() == entry.size
                    && existing.modified().ok().map(seconds) == Some(seconds(entry.modified));
                if unchanged {
                    continue;
                }
            }

            let incoming = Some(FileSummary::new(entry.size, Some(entry.modified)));
            let archive_name = self.ctx.sandbox.relative(&target)?;
            match policy
                .check_and_prepare(&target, &archive_name, incoming, flags.force, flags.dry_run)
                .await?
            {
                Proceed::Archived(path) | Proceed::WouldArchive(path) => {
                    outcome.archived.push(path.display().to_string())
                }
                Proceed::Clear => {}
            }

            if !flags.dry_run {
                self.preserver.copy_file(&entry.path, &target).await?;
            }
            outcome.bytes_transferred += entry.size;
            outcome.files.push(relative);
        }

        Ok(outcome)
    }

    /// Soft success for vanished sources when the settings allow it.
    /// Returns whether anything vanished.
    fn accept_exit(&self, outcome: &CopyOutcome) -> Result<bool> {
        match outcome.exit {
            CopyExit::Complete => Ok(false),
            CopyExit::SourceVanished if self.ctx.settings.vanished_files_are_success => {
                self.ledger.append(
                    LogLevel::Warn,
                    &format!("{}: some source files vanished during the transfer", self.transport.name()),
                )?;
                Ok(true)
            }
            CopyExit::SourceVanished => Err(ShuttleError::SourceVanished(format!(
                "{} reported vanished source files",
                self.transport.name()
            ))),
        }
    }
}

/// Size of a file that must already exist
async fn existing_len(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .map_err(|_| ShuttleError::preflight_error(path, "source does not exist"))
}

fn seconds(time: std::time::SystemTime) -> u64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
