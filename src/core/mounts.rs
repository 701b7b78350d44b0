//! Mount table access with validated mount and retrying unmount.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::hardware::{HardwareAdapter, ToolStatus};
use super::models::MountEntry;

/// Characters that are never accepted in labels or mount paths.
const QUOTE_CHARS: [char; 2] = ['\'', '"'];

#[derive(Debug, Error)]
pub enum MountError {
    #[error("refusing unsafe characters in {what}: {value:?}")]
    UnsafeCharacters { what: &'static str, value: String },

    #[error("{0} is already an active mount point")]
    AlreadyMounted(String),

    #[error("mount tool failed with {0}")]
    ToolFailed(ToolStatus),

    #[error("failed to create mount point {path}: {source}")]
    CreateMountPoint {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Query(#[from] anyhow::Error),
}

pub struct MountTable {
    adapter: Arc<dyn HardwareAdapter>,
    retry_interval: Duration,
}

impl MountTable {
    pub fn new(adapter: Arc<dyn HardwareAdapter>, retry_interval: Duration) -> Self {
        Self {
            adapter,
            retry_interval,
        }
    }

    /// Read the live mount table. Never cached: mounts change between calls.
    pub async fn list_mounts(&self) -> anyhow::Result<Vec<MountEntry>> {
        self.adapter.query_mounts().await
    }

    pub async fn is_mount_point(&self, path: &Path) -> anyhow::Result<bool> {
        let mounts = self.list_mounts().await?;
        Ok(mounts.iter().any(|m| Path::new(&m.mount_path) == path))
    }

    /// Mount the filesystem labelled `label` at `target`, creating the
    /// directory when needed.
    pub async fn mount(&self, label: &str, target: &Path) -> Result<(), MountError> {
        reject_quotes("label", label)?;
        reject_quotes("mount path", &target.to_string_lossy())?;

        if !target.exists() {
            info!(path = %target.display(), "Creating mount point");
            std::fs::create_dir_all(target).map_err(|source| MountError::CreateMountPoint {
                path: target.display().to_string(),
                source,
            })?;
        } else if self.is_mount_point(target).await? {
            error!(path = %target.display(), "Cannot mount, path is already in use");
            return Err(MountError::AlreadyMounted(target.display().to_string()));
        }

        let status = self.adapter.mount_label(label, target).await?;
        if !status.success() {
            error!(label = %label, path = %target.display(), %status, "Mount failed");
            return Err(MountError::ToolFailed(status));
        }

        info!(label = %label, path = %target.display(), "Mounted");
        Ok(())
    }

    /// Unmount `target`, retrying while the mount stays busy.
    ///
    /// Returns immediately when `target` does not exist or is not mounted.
    /// Busy mounts are retried every `retry_interval` until they go away.
    pub async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !target.exists() {
            debug!(path = %target.display(), "Nothing to unmount, path does not exist");
            return Ok(());
        }
        reject_quotes("mount path", &target.to_string_lossy())?;

        let mut attempt: u32 = 0;
        loop {
            if !self.is_mount_point(target).await? {
                if attempt > 0 {
                    info!(path = %target.display(), "Unmounted");
                }
                return Ok(());
            }

            attempt += 1;
            let status = self.adapter.unmount(target).await?;
            if status.success() {
                continue;
            }

            warn!(
                path = %target.display(),
                %status,
                attempt,
                retry_in = ?self.retry_interval,
                "Unmount failed, retrying"
            );
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

fn reject_quotes(what: &'static str, value: &str) -> Result<(), MountError> {
    if value.contains(QUOTE_CHARS) {
        error!(what, value = %value, "Rejected value containing a quote character");
        return Err(MountError::UnsafeCharacters {
            what,
            value: value.to_string(),
        });
    }
    Ok(())
}
