//! Copying files while keeping their modification time and permissions

use std::path::Path;

use filetime::FileTime;
use tokio::fs;
use tracing::warn;

use crate::error::{Result, ShuttleError};

/// Copies content, then modification time and permission bits
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributePreserver;

impl AttributePreserver {
    /// Give `destination` the mtime and permissions of `source`
    pub async fn copy_attributes(&self, source: &Path, destination: &Path) -> Result<()> {
        let metadata = fs::metadata(source).await.map_err(|e| {
            ShuttleError::path_error(source, format!("Failed to read metadata: {}", e))
        })?;

        set_permissions(destination, get_permissions(&metadata)).await?;
        if let Ok(modified) = metadata.modified() {
            filetime::set_file_mtime(destination, FileTime::from_system_time(modified)).map_err(|e| {
                ShuttleError::path_error(destination, format!("Failed to set modification time: {}", e))
            })?;
        }
        Ok(())
    }

    /// Copy file content, then attributes. Returns bytes copied.
    ///
    /// Missing parent directories are created. Attribute failures are logged, not returned.
    pub async fn copy_file(&self, source: &Path, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ShuttleError::path_error(parent, format!("Failed to create parent directory: {}", e))
            })?;
        }

        let bytes = fs::copy(source, destination).await?;

        if let Err(e) = self.copy_attributes(source, destination).await {
            warn!("Failed to preserve attributes for '{}': {}", destination.display(), e);
        }

        Ok(bytes)
    }
}

#[cfg(unix)]
async fn set_permissions(path: &Path, permissions: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(permissions);
    fs::set_permissions(path, perms)
        .await
        .map_err(|e| ShuttleError::path_error(path, format!("Failed to set permissions: {}", e)))
}

#[cfg(windows)]
async fn set_permissions(path: &Path, permissions: u32) -> Result<()> {
    let readonly = (permissions & 0o200) == 0;
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_readonly(readonly);
    fs::set_permissions(path, perms)
        .await
        .map_err(|e| ShuttleError::path_error(path, format!("Failed to set permissions: {}", e)))
}

/// Get file permissions in a cross-platform way
#[cfg(unix)]
pub(crate) fn get_permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(windows)]
pub(crate) fn get_permissions(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}
