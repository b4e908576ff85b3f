//! Push, pull, relay and share use cases
//!
//! Each use case opens a ledger entry first and closes it exactly once, whatever
//! happens in between. Failures are recorded as FAILED (PARTIAL for a relay whose
//! pull phase already completed) before the error is returned to the caller.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, warn};

use crate::archive_store::{ArchiveStore, DirectoryArchiveStore};
use crate::collision::Confirm;
use crate::context::ShuttleContext;
use crate::error::{Result, ShuttleError};
use crate::layout::{remote, GLOBAL_TARGET};
use crate::ledger::{LedgerRecord, LogLevel, Operation, OperationFlags, OperationKind, OperationLedger, OperationStatus};
use crate::registry::{validate_remote_root, ServerProfile};
use crate::transfer::{TransferEngine, TransferOutcome};
use crate::transport::{normalize_source, Transport};

/// Ledger record plus what moved
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub record: LedgerRecord,
    pub outcome: TransferOutcome,
}

impl OperationReport {
    pub fn status(&self) -> OperationStatus {
        self.record.status
    }
}

/// Where a share lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareTarget {
    /// `local/outbox/<server-id>/`
    Server(String),
    /// `local/outbox/global/`
    Global,
}

impl ShareTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Server(id) => id,
            Self::Global => GLOBAL_TARGET,
        }
    }
}

pub struct Orchestrator<'a, T: Transport, S: ArchiveStore = DirectoryArchiveStore> {
    ctx: &'a ShuttleContext,
    ledger: OperationLedger,
    transport: T,
    confirm: &'a dyn Confirm,
    archive_store: Option<S>,
}

impl<'a, T: Transport> Orchestrator<'a, T, DirectoryArchiveStore> {
    /// Open the ledger under the sandbox; the archival store comes from `archive_store_dir`
    pub fn new(ctx: &'a ShuttleContext, transport: T, confirm: &'a dyn Confirm) -> Result<Self> {
        let ledger = OperationLedger::open(ctx.layout.human_log(), ctx.layout.structured_log())?;
        let archive_store = ctx.settings.archive_store_dir.as_ref().map(DirectoryArchiveStore::new);
        Ok(Self {
            ctx,
            ledger,
            transport,
            confirm,
            archive_store,
        })
    }
}

impl<'a, T: Transport, S: ArchiveStore> Orchestrator<'a, T, S> {
    pub fn with_archive_store<S2: ArchiveStore>(self, store: S2) -> Orchestrator<'a, T, S2> {
        Orchestrator {
            ctx: self.ctx,
            ledger: self.ledger,
            transport: self.transport,
            confirm: self.confirm,
            archive_store: Some(store),
        }
    }

    pub fn ledger(&self) -> &OperationLedger {
        &self.ledger
    }

    /// Newest ledger records first
    pub fn history(&self, limit: usize) -> Result<Vec<LedgerRecord>> {
        self.ledger.recent(limit)
    }

    fn engine(&self) -> TransferEngine<'_, T> {
        TransferEngine::new(self.ctx, &self.transport, &self.ledger, self.confirm)
    }

    /// PUSH: resolve, check the remote root, preflight, stage, relay
    pub async fn push(&self, server_id: &str, source: &Path, flags: OperationFlags) -> Result<OperationReport> {
        let operation = self.ledger.begin(
            OperationKind::Push,
            server_id,
            normalize_source(source).display().to_string(),
            self.inbox_label(server_id),
            flags,
        );
        let id = operation.id;

        let result = async {
            require("server", server_id)?;
            require_path(source)?;
            let profile = self.resolve(server_id)?;
            self.transport.check_tools()?;
            let outcome = self.engine().push(id, source, profile, flags).await?;
            self.archive_after(profile, &normalize_source(source), flags).await;
            Ok::<_, ShuttleError>(outcome)
        }
        .await;

        self.conclude(operation, result)
    }

    /// PULL: the peer's outbox into `destination`, default `local/inbox/<server>`
    pub async fn pull(
        &self,
        server_id: &str,
        destination: Option<&Path>,
        flags: OperationFlags,
    ) -> Result<OperationReport> {
        let dest_label = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.ctx.layout.inbox_dir(server_id));
        let operation = self.ledger.begin(
            OperationKind::Pull,
            server_id,
            self.outbox_label(server_id),
            dest_label.display().to_string(),
            flags,
        );

        let result = async {
            require("server", server_id)?;
            let profile = self.resolve(server_id)?;
            self.transport.check_tools()?;
            let outcome = self.engine().pull(profile, destination, flags).await?;
            self.archive_after(profile, Path::new(&outcome.destination), flags).await;
            Ok::<_, ShuttleError>(outcome)
        }
        .await;

        self.conclude(operation, result)
    }

    /// RELAY: pull from `from` into its local inbox, then push the pulled files
    /// (or the given subset, relative to that inbox) to `to`.
    ///
    /// The intermediate files stay in `local/inbox/<from>` so an interrupted relay
    /// can be inspected and resumed.
    pub async fn relay(
        &self,
        from: &str,
        to: &str,
        files: Option<&[PathBuf]>,
        flags: OperationFlags,
    ) -> Result<OperationReport> {
        let operation = self.ledger.begin(
            OperationKind::Relay,
            format!("{}->{}", from, to),
            self.outbox_label(from),
            self.inbox_label(to),
            flags,
        );
        let id = operation.id;

        let pulled = async {
            require("source server", from)?;
            require("destination server", to)?;
            if from == to {
                return Err(ShuttleError::InvalidArgument(
                    "relay source and destination must differ".to_string(),
                ));
            }
            let source_profile = self.resolve(from)?;
            let dest_profile = self.resolve(to)?;
            self.transport.check_tools()?;
            let pulled = self.engine().pull(source_profile, None, flags).await?;
            Ok::<_, ShuttleError>((pulled, dest_profile))
        }
        .await;

        let (pulled, dest_profile) = match pulled {
            Ok(phase) => phase,
            Err(e) => return Err(self.fail(operation, OperationStatus::Failed, 0, e)),
        };

        let candidates: Vec<PathBuf> = match files {
            Some(subset) => subset.to_vec(),
            None => pulled.files.clone(),
        };

        if candidates.is_empty() {
            self.note(LogLevel::Info, &format!("relay {} -> {}: nothing to relay", from, to));
            let record = self.ledger.finish(operation, OperationStatus::Skipped, 0, None)?;
            return Ok(OperationReport { record, outcome: pulled });
        }

        let inbox = self.ctx.layout.inbox_dir(from);
        let pushed = self
            .engine()
            .push_files(id, &inbox, &candidates, &pulled.items, dest_profile, flags)
            .await;
        let mut pushed = match pushed {
            Ok(pushed) => pushed,
            // a dry run moved nothing
            Err(e) if flags.dry_run => return Err(self.fail(operation, OperationStatus::Failed, 0, e)),
            Err(e) => {
                return Err(self.fail(operation, OperationStatus::Partial, pulled.bytes_transferred, e));
            }
        };

        self.archive_after(dest_profile, &inbox, flags).await;
        let bytes = pulled.bytes_transferred + pushed.bytes_transferred;
        if flags.dry_run {
            self.note(
                LogLevel::Info,
                &format!("DRY RUN: relay would forward {} file(s) to {}", pushed.files.len(), to),
            );
        }
        let recorded = if flags.dry_run { 0 } else { bytes };
        let record = self.ledger.finish(operation, OperationStatus::Success, recorded, None)?;
        pushed.bytes_transferred = bytes;
        pushed.vanished |= pulled.vanished;
        Ok(OperationReport { record, outcome: pushed })
    }

    /// SHARE: copy a local path into an outbox directory for peers to pull
    pub async fn share(&self, target: &ShareTarget, source: &Path, flags: OperationFlags) -> Result<OperationReport> {
        let outbox = self.ctx.layout.outbox_dir(target.name());
        let operation = self.ledger.begin(
            OperationKind::Share,
            target.name(),
            normalize_source(source).display().to_string(),
            outbox.display().to_string(),
            flags,
        );

        let result = async {
            require_path(source)?;
            if let ShareTarget::Server(id) = target {
                self.ctx.registry.lookup(id)?;
            }
            self.engine().share(source, &outbox, flags).await
        }
        .await;

        self.conclude(operation, result)
    }

    fn resolve(&self, server_id: &str) -> Result<&'a ServerProfile> {
        let profile = self.ctx.registry.resolve(server_id)?;
        validate_remote_root(profile)?;
        Ok(profile)
    }

    fn conclude(&self, operation: Operation, result: Result<TransferOutcome>) -> Result<OperationReport> {
        match result {
            Ok(outcome) => {
                let bytes = if outcome.dry_run { 0 } else { outcome.bytes_transferred };
                let record = self.ledger.finish(operation, OperationStatus::Success, bytes, None)?;
                Ok(OperationReport { record, outcome })
            }
            Err(e) => Err(self.fail(operation, OperationStatus::Failed, 0, e)),
        }
    }

    /// Record a terminal failure and hand the error back
    fn fail(&self, operation: Operation, status: OperationStatus, bytes: u64, e: ShuttleError) -> ShuttleError {
        if let Err(ledger_error) = self.ledger.finish(operation, status, bytes, Some(e.to_string())) {
            error!("failed to record operation outcome: {}", ledger_error);
        }
        e
    }

    /// Hand a completed transfer to the archival store, if asked. Never fails the operation.
    async fn archive_after(&self, profile: &ServerProfile, path: &Path, flags: OperationFlags) {
        if flags.dry_run || !(flags.archive || profile.archive_store) {
            return;
        }
        let Some(store) = &self.archive_store else {
            self.note(LogLevel::Warn, "archival requested but no archive_store_dir is configured");
            return;
        };
        match store.archive(&profile.id, path).await {
            Ok(key) => self.note(LogLevel::Info, &format!("archived '{}' as {}", path.display(), key)),
            Err(e) => self.note(LogLevel::Warn, &format!("archival of '{}' failed: {}", path.display(), e)),
        }
    }

    fn note(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.ledger.append(level, message) {
            warn!("failed to write ledger line: {}", e);
        }
    }

    fn inbox_label(&self, server_id: &str) -> String {
        self.ctx
            .registry
            .get(server_id)
            .map(|p| format!("{}:{}", p.destination(), remote::inbox_for(&p.remote_root, &self.ctx.local_name)))
            .unwrap_or_default()
    }

    fn outbox_label(&self, server_id: &str) -> String {
        self.ctx
            .registry
            .get(server_id)
            .map(|p| format!("{}:{}", p.destination(), remote::outbox(&p.remote_root)))
            .unwrap_or_default()
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ShuttleError::InvalidArgument(format!("{} is required", what)));
    }
    Ok(())
}

fn require_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ShuttleError::InvalidArgument("source path is required".to_string()));
    }
    Ok(())
}
