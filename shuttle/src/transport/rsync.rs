//! `rsync` over `ssh`

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{
    shell_quote, stderr_tail, ChangeKind, CopyExit, CopyOutcome, CopyRequest, Endpoint, ItemChange,
    Overwrite, SourceMode, Transport,
};
use crate::error::{Result, ShuttleError};
use crate::registry::ServerProfile;

const RSYNC: &str = "rsync";
const SSH: &str = "ssh";

/// `rsync` exit status for "some files vanished before they could be transferred"
pub const RSYNC_VANISHED: i32 = 24;

/// `ssh` exit status when the connection itself failed
const SSH_CONNECTION_FAILED: i32 = 255;

/// Itemized output: change string, length, name
const OUT_FORMAT: &str = "--out-format=%i|%l|%n";

#[derive(Debug, Clone)]
pub struct RsyncTransport {
    connect_timeout: Duration,
}

impl RsyncTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// `ssh` argument vector for `peer`, without the destination
    pub fn ssh_args(&self, peer: &ServerProfile) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            peer.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = &peer.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args
    }

    /// The `-e` value rsync uses to start its remote shell
    fn remote_shell(&self, peer: &ServerProfile) -> String {
        let mut shell = vec![SSH.to_string()];
        shell.extend(self.ssh_args(peer).into_iter().map(|arg| {
            if arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                shell_quote(&arg)
            } else {
                arg
            }
        }));
        shell.join(" ")
    }

    /// Full `rsync` argument vector for a request. Never contains `--delete`.
    pub fn rsync_args(&self, request: &CopyRequest<'_>) -> Result<Vec<OsString>> {
        if request.source.is_remote() && request.destination.is_remote() {
            return Err(ShuttleError::InvalidArgument(
                "rsync cannot copy between two remote endpoints".to_string(),
            ));
        }

        let mut args: Vec<OsString> = ["-a", "-z", "-s", "--partial", OUT_FORMAT]
            .iter()
            .map(OsString::from)
            .collect();

        if request.options.overwrite == Overwrite::SkipExisting {
            args.push("--ignore-existing".into());
        }
        if let Some(backup_dir) = &request.options.backup_dir {
            args.push("--backup".into());
            args.push(format!("--backup-dir={}", backup_dir).into());
        }
        if request.options.dry_run {
            args.push("--dry-run".into());
        }

        let remote = request.source.is_remote() || request.destination.is_remote();
        if remote {
            let peer = peer_of(request)?;
            args.push("-e".into());
            args.push(self.remote_shell(peer).into());
        }

        args.push(render_endpoint(request, &request.source, request.mode == SourceMode::Contents)?);
        args.push(render_endpoint(request, &request.destination, true)?);
        Ok(args)
    }

    async fn run_ssh(&self, peer: &ServerProfile, remote_command: &str) -> Result<std::process::Output> {
        Command::new(SSH)
            .args(self.ssh_args(peer))
            .arg(peer.destination())
            .arg(remote_command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(SSH, e))
    }
}

impl Transport for RsyncTransport {
    fn name(&self) -> &'static str {
        RSYNC
    }

    fn check_tools(&self) -> Result<()> {
        for tool in [RSYNC, SSH] {
            if which::which(tool).is_err() {
                return Err(ShuttleError::ToolMissing(tool.to_string()));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, peer), fields(server = %peer.id, host = %peer.host))]
    async fn probe(&self, peer: &ServerProfile, timeout: Duration) -> Result<()> {
        let output = match tokio::time::timeout(timeout, self.run_ssh(peer, "true")).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ShuttleError::connectivity_error(
                    &peer.host,
                    format!("no answer within {}s", timeout.as_secs()),
                ))
            }
        };
        if !output.status.success() {
            return Err(ShuttleError::connectivity_error(&peer.host, stderr_tail(&output.stderr)));
        }
        debug!("peer reachable");
        Ok(())
    }

    async fn ensure_remote_dir(&self, peer: &ServerProfile, path: &str) -> Result<()> {
        let command = format!("mkdir -p -- {}", shell_quote(path));
        let output = self.run_ssh(peer, &command).await?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(SSH_CONNECTION_FAILED) => Err(ShuttleError::connectivity_error(
                &peer.host,
                stderr_tail(&output.stderr),
            )),
            code => Err(ShuttleError::transfer_error(
                SSH,
                code.unwrap_or(-1),
                format!("cannot create '{}': {}", path, stderr_tail(&output.stderr)),
            )),
        }
    }

    #[instrument(skip(self, request), fields(dry_run = request.options.dry_run))]
    async fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome> {
        let args = self.rsync_args(request)?;
        debug!(?args, "running rsync");

        let output = Command::new(RSYNC)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(RSYNC, e))?;

        let exit = classify_exit(output.status.code(), &output.stderr)?;
        if exit == CopyExit::SourceVanished {
            warn!("rsync reported vanished source files: {}", stderr_tail(&output.stderr));
        }

        let items = parse_itemized(&String::from_utf8_lossy(&output.stdout));
        let bytes_transferred = items
            .iter()
            .filter(|item| item.kind != ChangeKind::Directory)
            .map(|item| item.size)
            .sum();

        Ok(CopyOutcome {
            items,
            bytes_transferred,
            exit,
        })
    }
}

/// Map an rsync exit status to a copy result
pub fn classify_exit(code: Option<i32>, stderr: &[u8]) -> Result<CopyExit> {
    match code {
        Some(0) => Ok(CopyExit::Complete),
        Some(RSYNC_VANISHED) => Ok(CopyExit::SourceVanished),
        Some(code) => Err(ShuttleError::transfer_error(RSYNC, code, stderr_tail(stderr))),
        None => Err(ShuttleError::transfer_error(RSYNC, -1, "terminated by a signal")),
    }
}

/// Parse `%i|%l|%n` lines. Attribute-only changes and unrelated lines are ignored.
pub fn parse_itemized(stdout: &str) -> Vec<ItemChange> {
    stdout.lines().filter_map(parse_item_line).collect()
}

fn parse_item_line(line: &str) -> Option<ItemChange> {
    let mut parts = line.splitn(3, '|');
    let flags = parts.next()?;
    let size: u64 = parts.next()?.trim().parse().ok()?;
    let name = parts.next()?.trim_end_matches('/');
    if name.is_empty() || name == "." || flags.len() < 3 {
        return None;
    }

    let mut chars = flags.chars();
    let update = chars.next()?;
    let file_type = chars.next()?;
    let attributes = chars.as_str();
    let created = attributes.chars().all(|c| c == '+');

    let kind = match (update, file_type) {
        ('c', 'd') if created => ChangeKind::Directory,
        (_, 'd') => return None,
        ('<' | '>' | 'c', 'f' | 'L' | 'D' | 'S') if created => ChangeKind::Created,
        ('<' | '>' | 'c', 'f' | 'L' | 'D' | 'S') => ChangeKind::Updated,
        _ => return None,
    };

    Some(ItemChange {
        path: name.into(),
        kind,
        size: if kind == ChangeKind::Directory { 0 } else { size },
    })
}

fn peer_of<'a>(request: &CopyRequest<'a>) -> Result<&'a ServerProfile> {
    request
        .peer
        .ok_or_else(|| ShuttleError::InvalidArgument("remote endpoint without a peer".to_string()))
}

/// Local paths as given, remote ones as `user@host:path`, with a trailing
/// separator only when `as_directory` asks for one
fn render_endpoint(request: &CopyRequest<'_>, endpoint: &Endpoint, as_directory: bool) -> Result<OsString> {
    let mut rendered = match endpoint {
        Endpoint::Local(path) => path.clone().into_os_string(),
        Endpoint::Remote(path) => {
            let peer = peer_of(request)?;
            OsString::from(format!("{}:{}", peer.destination(), path))
        }
    };
    let has_separator = rendered.to_string_lossy().ends_with('/');
    if as_directory && !has_separator {
        rendered.push("/");
    }
    Ok(rendered)
}

fn spawn_error(tool: &str, error: std::io::Error) -> ShuttleError {
    if error.kind() == std::io::ErrorKind::NotFound {
        ShuttleError::ToolMissing(tool.to_string())
    } else {
        ShuttleError::transfer_error(tool, -1, format!("failed to start: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CopyOptions;
    use std::path::{Path, PathBuf};
    use test_case::test_case;

    fn peer() -> ServerProfile {
        ServerProfile {
            id: "web-01".to_string(),
            name: "web".to_string(),
            host: "10.0.0.5".to_string(),
            port: 2222,
            user: "alice".to_string(),
            identity_file: Some(PathBuf::from("/home/u/.ssh/id ed25519")),
            remote_root: "/srv/shuttle".to_string(),
            enabled: true,
            archive_store: false,
        }
    }

    fn as_strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_staging_copy_keeps_directory_name() {
        let transport = RsyncTransport::new(Duration::from_secs(10));
        let request = CopyRequest {
            peer: None,
            source: Endpoint::Local(PathBuf::from("/home/u/foo")),
            mode: SourceMode::Entry,
            destination: Endpoint::Local(PathBuf::from("/box/remote/web-01/push-1")),
            options: CopyOptions::default(),
        };
        let args = as_strings(transport.rsync_args(&request).unwrap());

        assert_eq!(&args[..5], ["-a", "-z", "-s", "--partial", "--out-format=%i|%l|%n"]);
        assert!(args.contains(&"--ignore-existing".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--delete")));
        assert!(!args.contains(&"-e".to_string()));
        assert_eq!(args[args.len() - 2], "/home/u/foo");
        assert_eq!(args[args.len() - 1], "/box/remote/web-01/push-1/");
    }

    #[test]
    fn test_current_directory_source_keeps_its_name() {
        let transport = RsyncTransport::new(Duration::from_secs(10));
        let request = CopyRequest {
            peer: None,
            source: Endpoint::Local(crate::transport::normalize_source(Path::new("./"))),
            mode: SourceMode::Entry,
            destination: Endpoint::Local(PathBuf::from("/box/remote/web-01/push-1")),
            options: CopyOptions::default(),
        };
        let args = as_strings(transport.rsync_args(&request).unwrap());

        let cwd = std::env::current_dir().unwrap();
        let source = &args[args.len() - 2];
        assert_ne!(source, ".");
        assert!(!source.ends_with('/'));
        assert_eq!(Path::new(source), cwd.as_path());
    }

    #[test]
    fn test_forced_push_to_peer() {
        let transport = RsyncTransport::new(Duration::from_secs(7));
        let profile = peer();
        let request = CopyRequest {
            peer: Some(&profile),
            source: Endpoint::Local(PathBuf::from("/box/remote/web-01/push-1")),
            mode: SourceMode::Contents,
            destination: Endpoint::Remote("/srv/shuttle/local/inbox/laptop".to_string()),
            options: CopyOptions {
                dry_run: true,
                overwrite: Overwrite::Replace,
                backup_dir: Some("/srv/shuttle/archive/20240101_000000".to_string()),
            },
        };
        let args = as_strings(transport.rsync_args(&request).unwrap());

        assert!(!args.contains(&"--ignore-existing".to_string()));
        assert!(args.contains(&"--backup".to_string()));
        assert!(args.contains(&"--backup-dir=/srv/shuttle/archive/20240101_000000".to_string()));
        assert!(args.contains(&"--dry-run".to_string()));

        let shell_at = args.iter().position(|a| a == "-e").unwrap();
        assert_eq!(
            args[shell_at + 1],
            "ssh -p 2222 -o BatchMode=yes -o ConnectTimeout=7 -i '/home/u/.ssh/id ed25519'"
        );
        assert_eq!(args[args.len() - 2], "/box/remote/web-01/push-1/");
        assert_eq!(args[args.len() - 1], "alice@10.0.0.5:/srv/shuttle/local/inbox/laptop/");
    }

    #[test]
    fn test_remote_to_remote_is_rejected() {
        let transport = RsyncTransport::new(Duration::from_secs(10));
        let profile = peer();
        let request = CopyRequest {
            peer: Some(&profile),
            source: Endpoint::Remote("/a".to_string()),
            mode: SourceMode::Contents,
            destination: Endpoint::Remote("/b".to_string()),
            options: CopyOptions::default(),
        };
        assert!(transport.rsync_args(&request).is_err());
    }

    #[test]
    fn test_parse_itemized_output() {
        let stdout = "\
cd+++++++++|4096|foo/
>f+++++++++|12|foo/a.txt
>f.st......|30|foo/b.txt
.f..t......|5|foo/c.txt
.d..t......|4096|foo/
sending incremental file list
>f+++++++++|7|foo/with|pipe.txt
";
        let items = parse_itemized(stdout);
        assert_eq!(
            items,
            vec![
                ItemChange { path: "foo".into(), kind: ChangeKind::Directory, size: 0 },
                ItemChange { path: "foo/a.txt".into(), kind: ChangeKind::Created, size: 12 },
                ItemChange { path: "foo/b.txt".into(), kind: ChangeKind::Updated, size: 30 },
                ItemChange { path: "foo/with|pipe.txt".into(), kind: ChangeKind::Created, size: 7 },
            ]
        );
    }

    #[test_case(Some(0), true ; "complete")]
    #[test_case(Some(24), true ; "vanished")]
    #[test_case(Some(23), false ; "partial transfer error")]
    #[test_case(Some(12), false ; "protocol stream error")]
    #[test_case(None, false ; "signal")]
    fn test_classify_exit(code: Option<i32>, ok: bool) {
        assert_eq!(classify_exit(code, b"rsync: error").is_ok(), ok);
    }

    #[test]
    fn test_vanished_is_soft() {
        assert_eq!(classify_exit(Some(24), b"").unwrap(), CopyExit::SourceVanished);
        let error = classify_exit(Some(12), b"connection unexpectedly closed").unwrap_err();
        assert_eq!(error.exit_code().as_i32(), 5);
        assert!(error.to_string().contains("connection unexpectedly closed"));
    }

    #[test]
    fn test_missing_binary_maps_to_tool_missing() {
        let error = spawn_error("rsync", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(error.exit_code().as_i32(), 8);
    }
}
