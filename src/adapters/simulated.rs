use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::core::hardware::{
    BlockRecord, DeviceKind, FilesystemRecord, HardwareAdapter, ToolStatus,
};
use crate::core::models::MountEntry;

/// Exit code `mount`/`umount` use for a failed operation.
const MOUNT_FAILURE: i32 = 32;

#[derive(Default)]
struct HostState {
    block: Vec<BlockRecord>,
    filesystems: Vec<FilesystemRecord>,
    mounts: Vec<MountEntry>,
    mount_calls: Vec<(String, PathBuf)>,
    unmount_calls: Vec<PathBuf>,
    busy_unmounts: u32,
}

/// In-memory host with scripted devices and mounts.
///
/// Mounting by label and unmounting update both device views and the mount
/// table, so the workflow sees a consistent host.
#[derive(Default)]
pub struct SimulatedAdapter {
    state: Mutex<HostState>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small host: a system disk, a removable disk with a `BACKUP1`
    /// partition, and a `myFiles` dataset mounted under `mount_root`.
    pub fn demo(mount_root: &Path) -> Self {
        let adapter = Self::new();
        adapter.add_partition("/dev/sda", "/dev/sda1", "system");
        adapter.mark_mounted("/dev/sda1", "/");
        adapter.add_partition("/dev/sdb", "/dev/sdb1", "BACKUP1");
        adapter.add_mount("myFiles", &mount_root.join("myFiles").to_string_lossy());
        adapter
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a partition (and its disk, on first use) to both device views.
    pub fn add_partition(&self, disk: &str, partition: &str, label: &str) {
        let mut state = self.state();
        let disk_index = match state.block.iter().position(|d| d.name == disk) {
            Some(index) => index,
            None => {
                let major = 8;
                let minor = 16 * state.block.len() as u32;
                state.block.push(block_record(disk, major, minor, DeviceKind::Disk));
                state.filesystems.push(fs_record(disk, None, None));
                state.block.len() - 1
            }
        };

        let block_disk = &mut state.block[disk_index];
        let (major, disk_minor) = split_numbers(&block_disk.maj_min);
        let children = block_disk.children.get_or_insert_with(Vec::new);
        let minor = disk_minor + children.len() as u32 + 1;
        children.push(block_record(partition, major, minor, DeviceKind::Part));

        state.filesystems[disk_index]
            .children
            .get_or_insert_with(Vec::new)
            .push(fs_record(partition, Some(label), Some("exfat")));
    }

    /// Add a raw mount table entry, e.g. a pooled dataset.
    pub fn add_mount(&self, device_name: &str, mount_path: &str) {
        self.state().mounts.push(MountEntry {
            device_name: device_name.to_string(),
            mount_path: mount_path.to_string(),
            filesystem_type: "zfs".to_string(),
            raw_options: "(rw,xattr,noacl)".to_string(),
        });
    }

    /// Mount an existing partition without going through `mount_label`.
    pub fn mark_mounted(&self, partition: &str, mount_path: &str) {
        attach(&mut self.state(), partition, mount_path);
    }

    /// The next `count` unmount attempts fail as if the target were busy.
    pub fn set_busy_unmounts(&self, count: u32) {
        self.state().busy_unmounts = count;
    }

    pub fn mount_calls(&self) -> Vec<(String, PathBuf)> {
        self.state().mount_calls.clone()
    }

    pub fn unmount_calls(&self) -> Vec<PathBuf> {
        self.state().unmount_calls.clone()
    }
}

#[async_trait]
impl HardwareAdapter for SimulatedAdapter {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn query_block_devices(&self) -> Result<Vec<BlockRecord>> {
        Ok(self.state().block.clone())
    }

    async fn query_filesystems(&self) -> Result<Vec<FilesystemRecord>> {
        Ok(self.state().filesystems.clone())
    }

    async fn query_mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.state().mounts.clone())
    }

    async fn mount_label(&self, label: &str, target: &Path) -> Result<ToolStatus> {
        let mut state = self.state();
        state
            .mount_calls
            .push((label.to_string(), target.to_path_buf()));

        let Some(partition) = find_label(&state.filesystems, label) else {
            info!(label = %label, "(Simulated) No filesystem with this label");
            return Ok(ToolStatus::failed(MOUNT_FAILURE));
        };

        info!(label = %label, path = %target.display(), "(Simulated) Mounting");
        attach(&mut state, &partition, &target.to_string_lossy());
        Ok(ToolStatus::SUCCESS)
    }

    async fn unmount(&self, target: &Path) -> Result<ToolStatus> {
        let mut state = self.state();
        state.unmount_calls.push(target.to_path_buf());

        if state.busy_unmounts > 0 {
            state.busy_unmounts -= 1;
            info!(path = %target.display(), "(Simulated) Target is busy");
            return Ok(ToolStatus::failed(MOUNT_FAILURE));
        }

        let target = target.to_string_lossy();
        let Some(index) = state.mounts.iter().position(|m| m.mount_path == target) else {
            return Ok(ToolStatus::failed(MOUNT_FAILURE));
        };
        let entry = state.mounts.remove(index);
        set_block_mount(&mut state.block, &entry.device_name, None);
        set_fs_mount(&mut state.filesystems, &entry.device_name, None);
        info!(path = %target, "(Simulated) Unmounted");
        Ok(ToolStatus::SUCCESS)
    }
}

fn attach(state: &mut HostState, partition: &str, mount_path: &str) {
    set_block_mount(&mut state.block, partition, Some(mount_path));
    set_fs_mount(&mut state.filesystems, partition, Some(mount_path));
    state.mounts.push(MountEntry {
        device_name: partition.to_string(),
        mount_path: mount_path.to_string(),
        filesystem_type: "exfat".to_string(),
        raw_options: "(rw,relatime)".to_string(),
    });
}

fn block_record(name: &str, major: u32, minor: u32, kind: DeviceKind) -> BlockRecord {
    BlockRecord {
        name: name.to_string(),
        maj_min: format!("{}:{}", major, minor),
        rm: true,
        size: 64 * 1024 * 1024 * 1024,
        ro: false,
        kind,
        mountpoints: vec![None],
        children: None,
    }
}

fn fs_record(name: &str, label: Option<&str>, fstype: Option<&str>) -> FilesystemRecord {
    FilesystemRecord {
        name: name.to_string(),
        fstype: fstype.map(str::to_string),
        fsver: fstype.map(|_| "1.0".to_string()),
        label: label.map(str::to_string),
        uuid: label.map(|l| format!("SIM-{}", l)),
        mountpoints: vec![None],
        children: None,
    }
}

fn split_numbers(maj_min: &str) -> (u32, u32) {
    let mut parts = maj_min.split(':').map(|p| p.parse().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

fn find_label(records: &[FilesystemRecord], label: &str) -> Option<String> {
    records.iter().find_map(|r| {
        if r.label.as_deref() == Some(label) {
            Some(r.name.clone())
        } else {
            r.children.as_deref().and_then(|c| find_label(c, label))
        }
    })
}

fn set_block_mount(records: &mut [BlockRecord], name: &str, path: Option<&str>) {
    for record in records {
        if record.name == name {
            record.mountpoints = vec![path.map(str::to_string)];
        }
        if let Some(children) = record.children.as_mut() {
            set_block_mount(children, name, path);
        }
    }
}

fn set_fs_mount(records: &mut [FilesystemRecord], name: &str, path: Option<&str>) {
    for record in records {
        if record.name == name {
            record.mountpoints = vec![path.map(str::to_string)];
        }
        if let Some(children) = record.children.as_mut() {
            set_fs_mount(children, name, path);
        }
    }
}
