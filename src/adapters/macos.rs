use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

use super::{parse_mount_output, read_tool_output, split_fields};
use crate::core::hardware::{BlockRecord, FilesystemRecord, HardwareAdapter, ToolStatus};
use crate::core::models::MountEntry;

/// macOS hosts: mount handling through `/sbin/mount`.
///
/// There is no `lsblk` on macOS, so the device inventory is unavailable and
/// only the mount table side of the workflow can run here.
pub struct MacosAdapter;

#[async_trait]
impl HardwareAdapter for MacosAdapter {
    fn name(&self) -> &'static str {
        "macos"
    }

    async fn query_block_devices(&self) -> Result<Vec<BlockRecord>> {
        bail!("device inventory is not supported on macOS")
    }

    async fn query_filesystems(&self) -> Result<Vec<FilesystemRecord>> {
        bail!("device inventory is not supported on macOS")
    }

    async fn query_mounts(&self) -> Result<Vec<MountEntry>> {
        let output = read_tool_output("/sbin/mount", &[]).await?;
        Ok(parse_mount_output(&output, parse_macos_mount_line))
    }

    async fn mount_label(&self, label: &str, target: &Path) -> Result<ToolStatus> {
        let status = Command::new("/sbin/mount")
            .arg("-w")
            .arg(format!("LABEL={}", label))
            .arg(target)
            .status()
            .await
            .context("Failed to run mount")?;
        Ok(status.into())
    }

    async fn unmount(&self, target: &Path) -> Result<ToolStatus> {
        let status = Command::new("/sbin/umount")
            .arg(target)
            .status()
            .await
            .context("Failed to run umount")?;
        Ok(status.into())
    }
}

/// `<device> on <path> (<fstype>, <options>)`
pub fn parse_macos_mount_line(line: &str) -> Option<MountEntry> {
    let parts = split_fields(line, 4);
    if parts.len() < 4 {
        return None;
    }
    let raw_options = parts[3];
    let filesystem_type = raw_options
        .split(',')
        .next()
        .map(|t| t.trim().trim_start_matches('(').trim_end_matches(')'))
        .unwrap_or_default();

    Some(MountEntry {
        device_name: parts[0].to_string(),
        mount_path: parts[2].to_string(),
        filesystem_type: filesystem_type.to_string(),
        raw_options: raw_options.to_string(),
    })
}
