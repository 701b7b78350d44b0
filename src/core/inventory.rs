//! Device inventory built from two independent listings.
//!
//! Block topology (size, numbering, removability) and filesystem metadata
//! (label, UUID, type) come from separate queries. They are merged by
//! position, so the shape of both forests is checked at every level instead
//! of being assumed.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::hardware::{BlockDevice, BlockRecord, FilesystemRecord, HardwareAdapter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("device listings disagree in shape at {location}: {detail}")]
    MergeShapeMismatch { location: String, detail: String },

    #[error("malformed device number {0:?}, expected <major>:<minor>")]
    MalformedDeviceNumber(String),

    #[error("device inventory queried before a successful refresh")]
    NotInitialized,
}

/// Merged view of all block devices on the host.
pub struct DeviceInventory {
    adapter: Arc<dyn HardwareAdapter>,
    devices: Option<Vec<BlockDevice>>,
}

impl DeviceInventory {
    pub fn new(adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self {
            adapter,
            devices: None,
        }
    }

    /// Query both listings and replace the merged tree.
    ///
    /// On failure the previous tree (if any) is kept.
    pub async fn refresh(&mut self) -> anyhow::Result<()> {
        let block = self.adapter.query_block_devices().await?;
        let filesystems = self.adapter.query_filesystems().await?;

        let devices = merge_listings(&block, &filesystems)?;
        debug!(
            adapter = self.adapter.name(),
            top_level = devices.len(),
            total = count_nodes(&devices),
            "Device inventory refreshed"
        );
        self.devices = Some(devices);
        Ok(())
    }

    /// The merged forest from the last refresh.
    pub fn devices(&self) -> Result<&[BlockDevice], InventoryError> {
        self.devices.as_deref().ok_or(InventoryError::NotInitialized)
    }

    /// All devices matching `predicate`, in pre-order.
    pub fn find<P>(&self, predicate: P) -> Result<Vec<&BlockDevice>, InventoryError>
    where
        P: Fn(&BlockDevice) -> bool,
    {
        let devices = self.devices()?;
        Ok(flatten(devices)
            .into_iter()
            .filter(|device| predicate(*device))
            .collect())
    }
}

/// Flatten a forest so each node is immediately followed by its descendants.
pub fn flatten(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    let mut out = Vec::new();
    for device in devices {
        push_preorder(device, &mut out);
    }
    out
}

fn push_preorder<'a>(device: &'a BlockDevice, out: &mut Vec<&'a BlockDevice>) {
    out.push(device);
    for child in &device.children {
        push_preorder(child, out);
    }
}

fn count_nodes(devices: &[BlockDevice]) -> usize {
    devices
        .iter()
        .map(|device| 1 + count_nodes(&device.children))
        .sum()
}

/// Zip the two forests position by position into merged devices.
pub fn merge_listings(
    block: &[BlockRecord],
    filesystems: &[FilesystemRecord],
) -> Result<Vec<BlockDevice>, InventoryError> {
    merge_level(block, filesystems, "top level")
}

fn merge_level(
    block: &[BlockRecord],
    filesystems: &[FilesystemRecord],
    location: &str,
) -> Result<Vec<BlockDevice>, InventoryError> {
    if block.len() != filesystems.len() {
        return Err(InventoryError::MergeShapeMismatch {
            location: location.to_string(),
            detail: format!(
                "{} block records vs {} filesystem records",
                block.len(),
                filesystems.len()
            ),
        });
    }

    block
        .iter()
        .zip(filesystems)
        .map(|(b, fs)| merge_device(b, fs))
        .collect()
}

fn merge_device(
    block: &BlockRecord,
    fs: &FilesystemRecord,
) -> Result<BlockDevice, InventoryError> {
    if block.name != fs.name {
        warn!(
            block = %block.name,
            filesystem = %fs.name,
            "Device names differ at the same listing position"
        );
    }

    let children = match (&block.children, &fs.children) {
        (Some(b), Some(f)) => merge_level(b, f, &block.name)?,
        (None, None) => Vec::new(),
        (b, f) => {
            return Err(InventoryError::MergeShapeMismatch {
                location: block.name.clone(),
                detail: format!(
                    "block view {} children, filesystem view {} children",
                    presence(b.is_some()),
                    presence(f.is_some())
                ),
            });
        }
    };

    let (major_number, minor_number) = parse_device_number(&block.maj_min)?;

    Ok(BlockDevice {
        name: block.name.clone(),
        major_number,
        minor_number,
        removable: block.rm,
        size_bytes: block.size,
        read_only: block.ro,
        kind: block.kind,
        mount_points: block.mountpoints.clone(),
        filesystem_type: fs.fstype.clone(),
        filesystem_version: fs.fsver.clone(),
        label: fs.label.clone(),
        uuid: fs.uuid.clone(),
        children,
    })
}

fn presence(present: bool) -> &'static str {
    if present { "has" } else { "has no" }
}

/// Parse a `major:minor` token: two unsigned decimal integers, nothing else.
pub fn parse_device_number(token: &str) -> Result<(u32, u32), InventoryError> {
    let malformed = || InventoryError::MalformedDeviceNumber(token.to_string());
    let number = |part: &str| -> Result<u32, InventoryError> {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        part.parse().map_err(|_| malformed())
    };

    let mut parts = token.split(':');
    let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed());
    };
    Ok((number(major)?, number(minor)?))
}
