//! Process-wide immutable context, built once at start-up

use std::path::Path;

use sysinfo::System;
use tracing::{debug, warn};

use crate::config::{Settings, ShuttleConfig};
use crate::error::Result;
use crate::layout::SandboxLayout;
use crate::registry::ServerRegistry;
use crate::sandbox::PathSandbox;

/// Everything an operation reads but never changes
#[derive(Debug, Clone)]
pub struct ShuttleContext {
    pub layout: SandboxLayout,
    pub sandbox: PathSandbox,
    pub settings: Settings,
    pub registry: ServerRegistry,
    /// Name this machine uses for its inbox on peers
    pub local_name: String,
}

impl ShuttleContext {
    /// Build the context for a sandbox root that already exists.
    ///
    /// The layout is rebased on the canonical root so every derived path compares
    /// cleanly against the sandbox.
    pub fn new(root: impl AsRef<Path>, config: &ShuttleConfig) -> Result<Self> {
        let sandbox = PathSandbox::new(root)?;
        let layout = SandboxLayout::new(sandbox.root());
        let registry = config.registry();
        let local_name = resolve_local_name(config.settings.local_name.as_deref());
        debug!(root = %sandbox.root().display(), local_name = %local_name, servers = registry.len(), "context ready");

        Ok(Self {
            layout,
            sandbox,
            settings: config.settings.clone(),
            registry,
            local_name,
        })
    }

    /// Create the standard tree under `root`, load the configuration (defaults when
    /// the file is absent) and build the context.
    pub async fn load(root: impl AsRef<Path>, config_path: Option<&Path>) -> Result<Self> {
        let root = root.as_ref();
        SandboxLayout::new(root).ensure().await?;

        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| SandboxLayout::new(root).config_file());
        let config = ShuttleConfig::load_or_default(&config_path).await?;
        Self::new(root, &config)
    }
}

/// Configured name, else the host name, reduced to `[A-Za-z0-9._-]`
pub fn resolve_local_name(configured: Option<&str>) -> String {
    let raw = match configured {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => System::host_name().unwrap_or_default(),
    };
    let cleaned = sanitize_name(&raw);
    if cleaned.is_empty() {
        warn!("cannot determine a usable host name, using 'localhost'");
        "localhost".to_string()
    } else {
        cleaned
    }
}

fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == '-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_name_sanitized() {
        assert_eq!(resolve_local_name(Some("laptop")), "laptop");
        assert_eq!(resolve_local_name(Some("my laptop/2")), "my-laptop-2");
        assert_eq!(resolve_local_name(Some("..")), "localhost");
        assert!(!resolve_local_name(None).is_empty());
    }

    #[tokio::test]
    async fn test_load_creates_layout_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("box");
        std::fs::create_dir_all(&root).unwrap();

        let ctx = ShuttleContext::load(&root, None).await.unwrap();
        assert!(ctx.layout.logs_dir().is_dir());
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.sandbox.root(), ctx.layout.root());
    }
}
