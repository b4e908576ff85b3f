//! Append-only operation ledger: a human log and a JSON-lines log
//!
//! Every operation gets exactly one structured record. [`OperationLedger::finish`]
//! consumes the in-flight [`Operation`], so a second terminal write cannot compile.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, ShuttleError};

/// What an operation does
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Push,
    Pull,
    Relay,
    Share,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Relay => "relay",
            Self::Share => "share",
        };
        f.write_str(name)
    }
}

/// Terminal state of an operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Success,
    Partial,
    Failed,
    Skipped,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Human log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Flags recorded with every operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationFlags {
    pub dry_run: bool,
    pub force: bool,
    /// Hand the result to the archival store after a successful transfer
    pub archive: bool,
}

/// An operation that has started but not finished
#[derive(Debug)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub server_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub started_at: DateTime<Utc>,
    pub flags: OperationFlags,
}

/// One line of `sync.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub uuid: String,
    pub operation: OperationKind,
    pub server_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub timestamp_start: String,
    pub timestamp_end: String,
    pub status: OperationStatus,
    pub bytes_transferred: u64,
    #[serde(default)]
    pub error_message: String,
    pub dry_run: bool,
    pub force: bool,
}

/// Writer for the two ledger files
#[derive(Debug, Clone)]
pub struct OperationLedger {
    human_log: PathBuf,
    structured_log: PathBuf,
}

impl OperationLedger {
    /// Open (creating the directory if needed) the two logs
    pub fn open(human_log: impl Into<PathBuf>, structured_log: impl Into<PathBuf>) -> Result<Self> {
        let human_log = human_log.into();
        let structured_log = structured_log.into();
        for path in [&human_log, &structured_log] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ShuttleError::Ledger(format!("cannot create '{}': {}", parent.display(), e))
                })?;
            }
        }
        Ok(Self {
            human_log,
            structured_log,
        })
    }

    pub fn human_log(&self) -> &Path {
        &self.human_log
    }

    pub fn structured_log(&self) -> &Path {
        &self.structured_log
    }

    /// Start an operation and assign its id
    pub fn begin(
        &self,
        kind: OperationKind,
        server_id: impl Into<String>,
        source_path: impl Into<String>,
        dest_path: impl Into<String>,
        flags: OperationFlags,
    ) -> Operation {
        let operation = Operation {
            id: new_operation_id(),
            kind,
            server_id: server_id.into(),
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            started_at: Utc::now(),
            flags,
        };
        info!(
            uuid = %operation.id,
            operation = %operation.kind,
            server = %operation.server_id,
            dry_run = flags.dry_run,
            force = flags.force,
            "operation started"
        );
        operation
    }

    /// Record the terminal state. The JSON line is written even if the human line fails.
    pub fn finish(
        &self,
        operation: Operation,
        status: OperationStatus,
        bytes_transferred: u64,
        error_message: Option<String>,
    ) -> Result<LedgerRecord> {
        let record = LedgerRecord {
            uuid: operation.id.hyphenated().to_string(),
            operation: operation.kind,
            server_id: operation.server_id,
            source_path: operation.source_path,
            dest_path: operation.dest_path,
            timestamp_start: format_timestamp(operation.started_at),
            timestamp_end: format_timestamp(Utc::now()),
            status,
            bytes_transferred,
            error_message: error_message.unwrap_or_default(),
            dry_run: operation.flags.dry_run,
            force: operation.flags.force,
        };

        let level = match status {
            OperationStatus::Success | OperationStatus::Skipped => LogLevel::Info,
            OperationStatus::Partial => LogLevel::Warn,
            OperationStatus::Failed => LogLevel::Error,
        };
        let mut summary = format!(
            "{} {} server={} source={} dest={} status={} bytes={}{}",
            record.operation,
            record.uuid,
            record.server_id,
            record.source_path,
            record.dest_path,
            record.status,
            record.bytes_transferred,
            if record.dry_run { " dry_run" } else { "" },
        );
        if !record.error_message.is_empty() {
            summary.push_str(&format!(" error=\"{}\"", record.error_message));
        }
        let human = self.append(level, &summary);

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        append_line(&self.structured_log, &line)?;
        human?;

        Ok(record)
    }

    /// Add a free-form line to the human log, mirrored to tracing
    pub fn append(&self, level: LogLevel, message: &str) -> Result<()> {
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        let line = format!("[{}] [{}] {}\n", format_timestamp(Utc::now()), level, flatten(message));
        append_line(&self.human_log, &line)
    }

    /// The last `limit` structured records, newest first. Malformed lines are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerRecord>> {
        let content = match std::fs::read_to_string(&self.structured_log) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ShuttleError::Ledger(format!("cannot read ledger: {}", e))),
        };

        let mut records: Vec<LedgerRecord> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("skipping malformed ledger line: {}", e);
                    None
                }
            })
            .collect();

        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        records.reverse();
        Ok(records)
    }
}

/// UTC, ISO-8601, second precision
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A fresh operation id from the OS entropy source.
///
/// If the OS source fails, the id is derived from the clock, the process id and a
/// process-local counter instead of blocking or aborting.
pub fn new_operation_id() -> Uuid {
    let mut bytes = [0u8; 16];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes).into_uuid(),
        Err(e) => {
            warn!("entropy source unavailable ({}), using fallback operation id", e);
            fallback_operation_id()
        }
    }
}

fn fallback_operation_id() -> Uuid {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    let pid = u64::from(std::process::id());
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&nanos.to_be_bytes());
    bytes[8..].copy_from_slice(&(pid << 32 ^ count).to_be_bytes());
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Keep one message on one line
fn flatten(message: &str) -> String {
    message.replace(['\n', '\r'], " ")
}

/// One `write_all` of a complete line on an `O_APPEND` handle
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ShuttleError::Ledger(format!("cannot open '{}': {}", path.display(), e)))?;
    file.write_all(line.as_bytes())
        .map_err(|e| ShuttleError::Ledger(format!("cannot write '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger_in(temp_dir: &TempDir) -> OperationLedger {
        OperationLedger::open(
            temp_dir.path().join("logs/sync.log"),
            temp_dir.path().join("logs/sync.jsonl"),
        )
        .unwrap()
    }

    #[test]
    fn test_finish_writes_one_line_per_log() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger_in(&temp_dir);

        let op = ledger.begin(
            OperationKind::Push,
            "web-01",
            "/home/u/docs",
            "/srv/box/local/inbox/laptop",
            OperationFlags { dry_run: true, ..Default::default() },
        );
        let record = ledger.finish(op, OperationStatus::Success, 42, None).unwrap();

        let jsonl = std::fs::read_to_string(ledger.structured_log()).unwrap();
        assert_eq!(jsonl.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(jsonl.trim()).unwrap();
        assert_eq!(parsed["operation"], "push");
        assert_eq!(parsed["status"], "SUCCESS");
        assert_eq!(parsed["bytes_transferred"], 42);
        assert_eq!(parsed["dry_run"], true);
        assert_eq!(parsed["uuid"], record.uuid);
        assert!(parsed["timestamp_start"].as_str().unwrap().ends_with('Z'));

        let human = std::fs::read_to_string(ledger.human_log()).unwrap();
        assert_eq!(human.lines().count(), 1);
        assert!(human.starts_with('['));
        assert!(human.contains("[INFO]"));
    }

    #[test]
    fn test_concurrent_finishes_write_whole_lines() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger_in(&temp_dir);

        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let ledger = &ledger;
                scope.spawn(move || {
                    for i in 0..25u64 {
                        let op = ledger.begin(
                            OperationKind::Push,
                            format!("web-{:02}", worker),
                            format!("/home/u/docs-{}", i),
                            "/srv/box/local/inbox/laptop",
                            OperationFlags::default(),
                        );
                        ledger.finish(op, OperationStatus::Success, worker * 100 + i, None).unwrap();
                    }
                });
            }
        });

        let jsonl = std::fs::read_to_string(ledger.structured_log()).unwrap();
        assert_eq!(jsonl.lines().count(), 200);
        for line in jsonl.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
        let records = ledger.recent(500).unwrap();
        let uuids: std::collections::HashSet<_> = records.iter().map(|r| r.uuid.clone()).collect();
        assert_eq!(uuids.len(), 200);
        assert_eq!(std::fs::read_to_string(ledger.human_log()).unwrap().lines().count(), 200);
    }

    #[test]
    fn test_structured_record_has_stable_field_set() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger_in(&temp_dir);
        let op = ledger.begin(OperationKind::Pull, "web-01", "a", "b", OperationFlags::default());
        ledger
            .finish(op, OperationStatus::Failed, 0, Some("boom\nsecond line".to_string()))
            .unwrap();

        let jsonl = std::fs::read_to_string(ledger.structured_log()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(jsonl.trim()).unwrap();
        let mut keys: Vec<_> = parsed.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "bytes_transferred", "dest_path", "dry_run", "error_message", "force",
                "operation", "server_id", "source_path", "status", "timestamp_end",
                "timestamp_start", "uuid",
            ]
        );

        let human = std::fs::read_to_string(ledger.human_log()).unwrap();
        assert_eq!(human.lines().count(), 1);
        assert!(human.contains("[ERROR]"));
    }

    #[test]
    fn test_operation_ids_are_unique_and_canonical() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_ne!(a, b);
        assert_eq!(a.hyphenated().to_string().len(), 36);
        assert_ne!(fallback_operation_id(), fallback_operation_id());
    }

    #[test]
    fn test_recent_returns_newest_first_and_skips_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger_in(&temp_dir);

        for server in ["aaa", "bbb", "ccc"] {
            let op = ledger.begin(OperationKind::Push, server, "s", "d", OperationFlags::default());
            ledger.finish(op, OperationStatus::Success, 1, None).unwrap();
        }
        append_line(ledger.structured_log(), "not json\n").unwrap();

        let recent = ledger.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].server_id, "ccc");
        assert_eq!(recent[1].server_id, "bbb");
    }

    #[test]
    fn test_recent_without_log_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ledger_in(&temp_dir);
        assert!(ledger.recent(10).unwrap().is_empty());
    }
}
