//! Error types and the process exit-code contract

use std::fmt;
use std::path::PathBuf;

/// Result type alias for shuttle operations
pub type Result<T> = std::result::Result<T, ShuttleError>;

/// Exit codes exposed to the command line front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed.
    Ok = 0,
    /// Anything not covered by a more specific code.
    General = 1,
    /// Missing or malformed arguments, including a missing source path.
    InvalidArguments = 2,
    /// Unknown, disabled or misconfigured server.
    Configuration = 3,
    /// A path escaped the sandbox root.
    Security = 4,
    /// The transfer tool failed, the peer was unreachable, or the payload was too large.
    Transfer = 5,
    /// The destination already exists and `--force` was not given.
    Collision = 6,
    /// The user declined an overwrite prompt.
    Declined = 7,
    /// `rsync` or `ssh` is not installed.
    ToolMissing = 8,
}

impl ExitCode {
    /// Numeric process exit status
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Short human description
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::General => "general error",
            Self::InvalidArguments => "invalid arguments",
            Self::Configuration => "configuration error",
            Self::Security => "sandbox violation",
            Self::Transfer => "transfer failure",
            Self::Collision => "destination exists",
            Self::Declined => "overwrite declined",
            Self::ToolMissing => "required tool missing",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_i32())
    }
}

/// Error type for every fallible shuttle operation
#[derive(Debug, thiserror::Error)]
pub enum ShuttleError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path-related errors that are not containment violations
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// Path resolved outside the sandbox root, or contained a traversal segment
    #[error("Security violation: '{path}' is not allowed under sandbox '{root}': {reason}")]
    SecurityViolation {
        path: PathBuf,
        root: PathBuf,
        reason: String,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Server identifier does not match the identifier rules
    #[error("Invalid server id '{id}': {reason}")]
    InvalidServerId { id: String, reason: String },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server is disabled: {0} (set enabled = true in the server profile)")]
    ServerDisabled(String),

    /// Remote root is not absolute, traverses, or points at a system directory
    #[error("Invalid remote root '{root}' for server '{server}': {reason}")]
    InvalidRemoteRoot {
        server: String,
        root: String,
        reason: String,
    },

    /// Source path missing or unreadable
    #[error("Preflight check failed for '{path}': {message}")]
    Preflight { path: PathBuf, message: String },

    /// Transfer payload exceeds the configured ceiling
    #[error("'{path}' is {size} bytes, exceeding the {limit} byte transfer limit")]
    Oversize { path: PathBuf, size: u64, limit: u64 },

    /// Destination exists and the caller did not pass force
    #[error("Destination '{path}' already exists; re-run with --force to archive and overwrite it")]
    Collision { path: PathBuf },

    /// Overwrite prompt answered with no
    #[error("Overwrite of '{path}' declined")]
    Declined { path: PathBuf },

    /// Connectivity probe failed before any data moved
    #[error("Cannot connect to {host}: {message}")]
    Connectivity { host: String, message: String },

    /// Transfer tool exited with a hard failure
    #[error("{tool} failed with exit status {status}: {message}")]
    Transfer {
        tool: String,
        status: i32,
        message: String,
    },

    /// Source entries vanished mid-run and soft success is disabled
    #[error("Some source files vanished during the transfer: {0}")]
    SourceVanished(String),

    /// A required external program is not installed
    #[error("Required tool '{0}' was not found in PATH")]
    ToolMissing(String),

    /// Advisory lock could not be taken
    #[error("Lock error at '{path}': {message}")]
    Lock { path: PathBuf, message: String },

    /// Ledger could not be written or read
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML decoding errors
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ShuttleError {
    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new sandbox violation
    pub fn security_violation(
        path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SecurityViolation {
            path: path.into(),
            root: root.into(),
            reason: reason.into(),
        }
    }

    /// Create a new preflight error
    pub fn preflight_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Preflight {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new transfer error
    pub fn transfer_error(tool: impl Into<String>, status: i32, message: impl Into<String>) -> Self {
        Self::Transfer {
            tool: tool.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a new connectivity error
    pub fn connectivity_error(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a new lock error
    pub fn lock_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Exit code the CLI reports for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidArgument(_) | Self::Preflight { .. } => ExitCode::InvalidArguments,
            Self::Configuration(_)
            | Self::Toml(_)
            | Self::InvalidServerId { .. }
            | Self::ServerNotFound(_)
            | Self::ServerDisabled(_)
            | Self::InvalidRemoteRoot { .. } => ExitCode::Configuration,
            Self::SecurityViolation { .. } => ExitCode::Security,
            Self::Oversize { .. }
            | Self::Connectivity { .. }
            | Self::Transfer { .. }
            | Self::SourceVanished(_) => ExitCode::Transfer,
            Self::Collision { .. } => ExitCode::Collision,
            Self::Declined { .. } => ExitCode::Declined,
            Self::ToolMissing(_) => ExitCode::ToolMissing,
            Self::Io(_)
            | Self::Path { .. }
            | Self::Lock { .. }
            | Self::Ledger(_)
            | Self::Serialization(_) => ExitCode::General,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ShuttleError::InvalidArgument("x".into()), 2 ; "invalid argument")]
    #[test_case(ShuttleError::ServerNotFound("abc".into()), 3 ; "unknown server")]
    #[test_case(ShuttleError::InvalidServerId { id: "ab".into(), reason: "short".into() }, 3 ; "bad id")]
    #[test_case(ShuttleError::security_violation("/etc", "/home/u/.sync-shuttle", "outside"), 4 ; "sandbox")]
    #[test_case(ShuttleError::transfer_error("rsync", 12, "stream"), 5 ; "transfer")]
    #[test_case(ShuttleError::Collision { path: "/x".into() }, 6 ; "collision")]
    #[test_case(ShuttleError::Declined { path: "/x".into() }, 7 ; "declined")]
    #[test_case(ShuttleError::ToolMissing("rsync".into()), 8 ; "tool missing")]
    fn test_exit_code_mapping(error: ShuttleError, expected: i32) {
        assert_eq!(error.exit_code().as_i32(), expected);
    }

    #[test]
    fn test_security_violation_message_names_both_paths() {
        let error = ShuttleError::security_violation("/tmp/x", "/root/box", "outside sandbox");
        let message = error.to_string();
        assert!(message.contains("/tmp/x"));
        assert!(message.contains("/root/box"));
    }
}
