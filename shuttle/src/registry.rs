//! Server profiles and their validation

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, ShuttleError};
use crate::layout::GLOBAL_TARGET;

/// Remote roots may not be, or live under, any of these
pub const REMOTE_ROOT_DENYLIST: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/lib", "/lib64", "/boot", "/dev", "/proc", "/sys", "/var",
    "/root", "/tmp",
];

/// A validated connection profile for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub remote_root: String,
    pub enabled: bool,
    /// Hand every successful transfer to the archival store
    pub archive_store: bool,
}

impl ServerProfile {
    /// `user@host`, or just `host` when no user is configured
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

/// Lookup of profiles by identifier.
///
/// Entries that failed to load are remembered with their reason, so naming one
/// fails with a configuration error while every other server stays usable.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerProfile>,
    rejected: BTreeMap<String, String>,
}

impl ServerRegistry {
    /// Build a registry, rejecting malformed identifiers and duplicates.
    pub fn from_profiles(profiles: impl IntoIterator<Item = ServerProfile>) -> Result<Self> {
        let mut registry = Self::default();
        for profile in profiles {
            registry.insert(profile)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, profile: ServerProfile) -> Result<()> {
        validate_server_id(&profile.id)?;
        if self.servers.contains_key(&profile.id) {
            return Err(ShuttleError::Configuration(format!(
                "duplicate server id '{}'",
                profile.id
            )));
        }
        self.servers.insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Keep `id` out of the registry and remember why
    pub fn reject(&mut self, id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(server = id, "skipping server entry: {}", reason);
        self.rejected.insert(id.to_string(), reason);
    }

    /// Entries that failed to load, with the reason
    pub fn rejected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rejected.iter().map(|(id, reason)| (id.as_str(), reason.as_str()))
    }

    /// Find a profile, enabled or not
    pub fn lookup(&self, id: &str) -> Result<&ServerProfile> {
        validate_server_id(id)?;
        if let Some(reason) = self.rejected.get(id) {
            return Err(ShuttleError::Configuration(reason.clone()));
        }
        self.servers
            .get(id)
            .ok_or_else(|| ShuttleError::ServerNotFound(id.to_string()))
    }

    /// Resolve an identifier to an enabled profile
    pub fn resolve(&self, id: &str) -> Result<&ServerProfile> {
        let profile = self.lookup(id)?;
        if !profile.enabled {
            return Err(ShuttleError::ServerDisabled(id.to_string()));
        }
        debug!(server = id, host = %profile.host, "resolved server profile");
        Ok(profile)
    }

    pub fn get(&self, id: &str) -> Option<&ServerProfile> {
        self.servers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerProfile> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Lowercase alphanumerics and single hyphens, 3-32 chars, not starting or
/// ending with a hyphen, and never the reserved share target.
pub fn validate_server_id(id: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(ShuttleError::InvalidServerId {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    };

    if id == GLOBAL_TARGET {
        return reject("'global' is reserved");
    }
    if !(3..=32).contains(&id.len()) {
        return reject("must be 3-32 characters");
    }
    if !id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
        return reject("only lowercase letters, digits and '-' are allowed");
    }
    if id.starts_with('-') || id.ends_with('-') {
        return reject("must not start or end with '-'");
    }
    if id.contains("--") {
        return reject("must not contain consecutive hyphens");
    }
    Ok(())
}

/// Syntactic guard against catastrophic remote roots.
///
/// The remote filesystem is never inspected; this only rules out relative
/// roots, traversal, and system directories.
pub fn validate_remote_root(profile: &ServerProfile) -> Result<()> {
    let root = profile.remote_root.as_str();
    let reject = |reason: String| {
        Err(ShuttleError::InvalidRemoteRoot {
            server: profile.id.clone(),
            root: root.to_string(),
            reason,
        })
    };

    if !root.starts_with('/') {
        return reject("must be an absolute path".to_string());
    }
    if root.chars().any(|c| c.is_control()) {
        return reject("must not contain control characters".to_string());
    }

    let segments: Vec<&str> = root.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    if segments.iter().any(|s| *s == "..") {
        return reject("must not contain '..'".to_string());
    }
    if segments.is_empty() {
        return reject("must not be the filesystem root".to_string());
    }

    for denied in REMOTE_ROOT_DENYLIST {
        let denied_segments: Vec<&str> = denied.split('/').filter(|s| !s.is_empty()).collect();
        if segments.starts_with(&denied_segments) {
            return reject(format!("must not be inside system directory {}", denied));
        }
    }

    Ok(())
}
