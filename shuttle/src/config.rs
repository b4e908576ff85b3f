//! Typed configuration schema and TOML loading

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ShuttleError};
use crate::registry::{validate_remote_root, validate_server_id, ServerProfile, ServerRegistry};

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShuttleConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

/// Which backend moves the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `rsync` over `ssh`
    #[default]
    Rsync,
    /// In-process delta copy for peers reachable on the local filesystem
    Native,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_transfer_bytes")]
    pub max_transfer_bytes: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub vanished_files_are_success: bool,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_native_mount")]
    pub native_mount: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_store_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_transfer_bytes: default_max_transfer_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            vanished_files_are_success: true,
            transport: TransportKind::default(),
            native_mount: default_native_mount(),
            local_name: None,
            log_level: default_log_level(),
            archive_retention_days: default_archive_retention_days(),
            lock_stale_secs: default_lock_stale_secs(),
            archive_store_dir: None,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

/// One `[servers.<id>]` table as written on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_base: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub s3_backup: bool,
}

impl ShuttleConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ShuttleError::Configuration(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let config: ShuttleConfig = toml::from_str(&content)?;
        info!(path = %path.display(), servers = config.servers.len(), "configuration loaded");
        Ok(config)
    }

    /// Load, or fall back to defaults when the file does not exist
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if tokio::fs::try_exists(path.as_ref()).await? {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ShuttleError::Configuration(format!("cannot encode configuration: {}", e)))?;
        let body = format!("# Sync Shuttle - Server Configuration\n\n{}", content);
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    /// Typed profiles for every server entry. A malformed entry is skipped with a
    /// warning and fails only the operations that name it.
    pub fn registry(&self) -> ServerRegistry {
        let mut registry = ServerRegistry::default();
        for (id, entry) in &self.servers {
            if let Err(e) = entry.to_profile(id).and_then(|profile| registry.insert(profile)) {
                registry.reject(id, e.to_string());
            }
        }
        registry
    }

    /// Add a disabled server with default values
    pub fn add_server(&mut self, id: &str) -> Result<()> {
        validate_server_id(id)?;
        if self.servers.contains_key(id) {
            return Err(ShuttleError::Configuration(format!("server already exists: {}", id)));
        }
        self.servers.insert(
            id.to_string(),
            ServerEntry {
                name: Some(id.to_string()),
                port: default_port(),
                ..Default::default()
            },
        );
        Ok(())
    }

    pub fn remove_server(&mut self, id: &str) -> Result<ServerEntry> {
        self.servers
            .remove(id)
            .ok_or_else(|| ShuttleError::ServerNotFound(id.to_string()))
    }

    /// Identifier and remote-root problems across every profile
    pub fn problems(&self) -> Vec<ShuttleError> {
        let mut problems = Vec::new();
        for (id, entry) in &self.servers {
            match entry.to_profile(id) {
                Ok(profile) => {
                    if let Err(e) = validate_server_id(id) {
                        problems.push(e);
                    }
                    if let Err(e) = validate_remote_root(&profile) {
                        problems.push(e);
                    }
                    if profile.enabled && profile.host.is_empty() {
                        problems.push(ShuttleError::Configuration(format!(
                            "server '{}' is enabled but has no host",
                            id
                        )));
                    }
                }
                Err(e) => problems.push(e),
            }
        }
        problems
    }
}

impl ServerEntry {
    /// Direct structured construction of a profile
    pub fn to_profile(&self, id: &str) -> Result<ServerProfile> {
        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                ShuttleError::Configuration(format!(
                    "server '{}' has invalid port {} (expected 1-65535)",
                    id, self.port
                ))
            })?;

        let remote_root = match &self.remote_base {
            Some(base) if !base.is_empty() => base.clone(),
            _ if !self.user.is_empty() => format!("/home/{}/.sync-shuttle", self.user),
            _ => String::new(),
        };

        Ok(ServerProfile {
            id: id.to_string(),
            name: self.name.clone().unwrap_or_else(|| id.to_string()),
            host: self.host.clone(),
            port,
            user: self.user.clone(),
            identity_file: self.identity_file.as_deref().map(expand_home),
            remote_root,
            enabled: self.enabled,
            archive_store: self.s3_backup,
        })
    }
}

/// Expand a leading `~/`
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

// Default value functions
fn default_max_transfer_bytes() -> u64 { 10 * 1024 * 1024 * 1024 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_native_mount() -> PathBuf { PathBuf::from("/") }
fn default_log_level() -> String { "info".to_string() }
fn default_archive_retention_days() -> u32 { 30 }
fn default_lock_stale_secs() -> u64 { 300 }
fn default_port() -> u32 { 22 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[settings]
max_transfer_bytes = 1024
transport = "native"

[servers.web-01]
name = "Web"
host = "10.0.0.5"
user = "alice"
enabled = true

[servers.backup-box]
host = "10.0.0.6"
port = 2222
user = "bob"
remote_base = "/srv/shuttle"
identity_file = "~/.ssh/id_ed25519"
s3_backup = true
"#;

    #[test]
    fn test_parse_applies_defaults() {
        let config: ShuttleConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.settings.max_transfer_bytes, 1024);
        assert_eq!(config.settings.transport, TransportKind::Native);
        assert_eq!(config.settings.connect_timeout_secs, 10);
        assert!(config.settings.vanished_files_are_success);

        let registry = config.registry();
        let web = registry.get("web-01").unwrap();
        assert_eq!(web.port, 22);
        assert_eq!(web.remote_root, "/home/alice/.sync-shuttle");
        assert!(web.enabled);

        let backup = registry.get("backup-box").unwrap();
        assert_eq!(backup.port, 2222);
        assert_eq!(backup.remote_root, "/srv/shuttle");
        assert!(!backup.enabled);
        assert!(backup.archive_store);
        assert!(!backup.identity_file.as_ref().unwrap().starts_with("~"));
    }

    #[test]
    fn test_invalid_port_is_configuration_error() {
        let entry = ServerEntry {
            host: "h".to_string(),
            port: 70000,
            ..Default::default()
        };
        assert!(matches!(entry.to_profile("web-01"), Err(ShuttleError::Configuration(_))));

        let zero = ServerEntry { port: 0, ..Default::default() };
        assert!(zero.to_profile("web-01").is_err());
    }

    #[test]
    fn test_broken_entry_does_not_hide_the_others() {
        let mut config: ShuttleConfig = toml::from_str(SAMPLE).unwrap();
        config.servers.insert(
            "web-02".to_string(),
            ServerEntry { host: "h".to_string(), port: 0, enabled: true, ..Default::default() },
        );
        config.servers.insert("ab".to_string(), ServerEntry { host: "h".to_string(), ..Default::default() });

        let registry = config.registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("web-01").is_ok());
        assert!(matches!(registry.resolve("web-02"), Err(ShuttleError::Configuration(_))));
        assert!(matches!(registry.resolve("ab"), Err(ShuttleError::InvalidServerId { .. })));
        assert_eq!(registry.rejected().count(), 2);
    }

    #[test]
    fn test_add_and_remove_server() {
        let mut config = ShuttleConfig::default();
        config.add_server("new-box").unwrap();
        assert!(config.add_server("new-box").is_err());
        assert!(config.add_server("ab").is_err());
        assert!(config.add_server("global").is_err());

        let registry = config.registry();
        assert!(matches!(registry.resolve("new-box"), Err(ShuttleError::ServerDisabled(_))));

        config.remove_server("new-box").unwrap();
        assert!(config.remove_server("new-box").is_err());
    }

    #[test]
    fn test_problems_reports_bad_remote_root() {
        let mut config: ShuttleConfig = toml::from_str(SAMPLE).unwrap();
        assert!(config.problems().is_empty());

        config.servers.get_mut("web-01").unwrap().remote_base = Some("/etc/shuttle".to_string());
        let problems = config.problems();
        assert_eq!(problems.len(), 1);
        assert!(matches!(problems[0], ShuttleError::InvalidRemoteRoot { .. }));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync-shuttle.toml");

        let mut config = ShuttleConfig::default();
        config.add_server("web-01").unwrap();
        config.save(&path).await.unwrap();

        let loaded = ShuttleConfig::load(&path).await.unwrap();
        assert!(loaded.servers.contains_key("web-01"));
        assert_eq!(loaded.servers["web-01"].port, 22);

        let missing = ShuttleConfig::load_or_default(temp_dir.path().join("nope.toml")).await.unwrap();
        assert!(missing.servers.is_empty());
    }
}
