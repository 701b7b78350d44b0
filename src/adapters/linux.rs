use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{parse_mount_output, read_tool_output, split_fields};
use crate::core::hardware::{BlockRecord, FilesystemRecord, HardwareAdapter, ToolStatus};
use crate::core::models::MountEntry;

/// Top-level shape of `lsblk --json`.
#[derive(Deserialize)]
struct LsblkOutput<T> {
    blockdevices: Vec<T>,
}

pub struct LinuxAdapter;

#[async_trait]
impl HardwareAdapter for LinuxAdapter {
    fn name(&self) -> &'static str {
        "linux"
    }

    async fn query_block_devices(&self) -> Result<Vec<BlockRecord>> {
        let json = read_tool_output("lsblk", &["--json", "-b", "-p"]).await?;
        parse_lsblk(&json).context("Failed to parse lsblk block listing")
    }

    async fn query_filesystems(&self) -> Result<Vec<FilesystemRecord>> {
        let json = read_tool_output("lsblk", &["--json", "-b", "-p", "-f"]).await?;
        parse_lsblk(&json).context("Failed to parse lsblk filesystem listing")
    }

    async fn query_mounts(&self) -> Result<Vec<MountEntry>> {
        let output = read_tool_output("mount", &[]).await?;
        Ok(parse_mount_output(&output, parse_linux_mount_line))
    }

    async fn mount_label(&self, label: &str, target: &Path) -> Result<ToolStatus> {
        let status = Command::new("mount")
            .arg("-rw")
            .arg(format!("LABEL={}", label))
            .arg(target)
            .status()
            .await
            .context("Failed to run mount")?;
        Ok(status.into())
    }

    async fn unmount(&self, target: &Path) -> Result<ToolStatus> {
        let status = Command::new("umount")
            .arg(target)
            .status()
            .await
            .context("Failed to run umount")?;
        Ok(status.into())
    }
}

fn parse_lsblk<T: for<'de> Deserialize<'de>>(json: &str) -> serde_json::Result<Vec<T>> {
    serde_json::from_str::<LsblkOutput<T>>(json).map(|out| out.blockdevices)
}

/// `<device> on <path> type <fstype> (<options>)`
pub fn parse_linux_mount_line(line: &str) -> Option<MountEntry> {
    let parts = split_fields(line, 6);
    if parts.len() < 6 {
        return None;
    }
    Some(MountEntry {
        device_name: parts[0].to_string(),
        mount_path: parts[2].to_string(),
        filesystem_type: parts[4].to_string(),
        raw_options: parts[5].trim().to_string(),
    })
}
