//! Sync Shuttle Library
//!
//! Sandboxed, auditable file transfers between this machine and named peers:
//! - Path containment for every local write
//! - Append-only operation ledger (human log + JSON lines)
//! - Refuse-unless-forced collision handling with pre-overwrite archives
//! - Staged push, direct pull, server-to-server relay and local share
//! - `rsync`/`ssh` transport, or an in-process copy for locally mounted peers

pub mod archive_store;
pub mod collision;
pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod preservation;
pub mod registry;
pub mod sandbox;
pub mod scanner;
pub mod transfer;
pub mod transport;

// Re-export main types and functions
pub use archive_store::{ArchiveStore, DirectoryArchiveStore};
pub use collision::{CollisionPolicy, Confirm, FileSummary, NonInteractive, OverwritePrompt, Proceed};
pub use config::{ServerEntry, Settings, ShuttleConfig, TransportKind};
pub use context::ShuttleContext;
pub use error::{ExitCode, Result, ShuttleError};
pub use layout::SandboxLayout;
pub use ledger::{LedgerRecord, OperationFlags, OperationKind, OperationLedger, OperationStatus};
pub use orchestrator::{OperationReport, Orchestrator, ShareTarget};
pub use registry::{ServerProfile, ServerRegistry};
pub use sandbox::PathSandbox;
pub use transfer::{TransferEngine, TransferOutcome};
pub use transport::{Backend, NativeTransport, RsyncTransport, Transport};
