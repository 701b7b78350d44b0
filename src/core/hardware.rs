use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use super::models::MountEntry;

/// Device type as reported by the block topology query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Part,
    /// Loop devices, optical drives, device-mapper targets and the like.
    #[serde(other)]
    Other,
}

/// A disk or partition, merged from the block and filesystem views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    pub name: String,
    pub major_number: u32,
    pub minor_number: u32,
    pub removable: bool,
    pub size_bytes: u64,
    pub read_only: bool,
    pub kind: DeviceKind,
    /// Mount paths, or sentinels such as `[SWAP]`.
    pub mount_points: Vec<Option<String>>,
    pub filesystem_type: Option<String>,
    pub filesystem_version: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// First real mount path, skipping nulls and sentinels such as `[SWAP]`.
    pub fn active_mount_point(&self) -> Option<&str> {
        self.mount_points
            .iter()
            .flatten()
            .map(String::as_str)
            .find(|path| !path.starts_with('['))
    }

    pub fn is_partition(&self) -> bool {
        self.kind == DeviceKind::Part
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label.as_deref() == Some(label)
    }
}

/// One node of the block topology listing (`lsblk --json -b -p`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockRecord {
    pub name: String,
    #[serde(rename = "maj:min")]
    pub maj_min: String,
    #[serde(deserialize_with = "flexible_bool")]
    pub rm: bool,
    #[serde(deserialize_with = "flexible_u64")]
    pub size: u64,
    #[serde(deserialize_with = "flexible_bool")]
    pub ro: bool,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    pub children: Option<Vec<BlockRecord>>,
}

/// One node of the filesystem listing (`lsblk --json -b -p -f`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilesystemRecord {
    pub name: String,
    pub fstype: Option<String>,
    pub fsver: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    pub children: Option<Vec<FilesystemRecord>>,
}

/// Exit status of an external tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolStatus {
    pub code: Option<i32>,
}

impl ToolStatus {
    pub const SUCCESS: ToolStatus = ToolStatus { code: Some(0) };

    pub fn failed(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ToolStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Host-specific access to the device, mount and unmount tools.
///
/// One implementation exists per platform family, plus an in-memory host used
/// for simulation and tests. The adapter is chosen once at startup.
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Short platform name for log output.
    fn name(&self) -> &'static str;

    /// Block topology view of all devices, as an ordered forest.
    async fn query_block_devices(&self) -> anyhow::Result<Vec<BlockRecord>>;

    /// Filesystem metadata view of all devices, same shape as the block view.
    async fn query_filesystems(&self) -> anyhow::Result<Vec<FilesystemRecord>>;

    /// Currently active mounts, freshly read.
    async fn query_mounts(&self) -> anyhow::Result<Vec<MountEntry>>;

    /// Mount the filesystem carrying `label` at `target`.
    async fn mount_label(&self, label: &str, target: &Path) -> anyhow::Result<ToolStatus>;

    /// Unmount whatever is mounted at `target`.
    async fn unmount(&self, target: &Path) -> anyhow::Result<ToolStatus>;
}

// Older util-linux releases print booleans and sizes as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrString {
    Bool(bool),
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => Ok(b),
        BoolOrString::Number(n) => Ok(n != 0),
        BoolOrString::Text(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected boolean flag, got {:?}",
                other
            ))),
        },
    }
}

fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_record_accepts_native_and_string_flags() {
        let modern: BlockRecord = serde_json::from_str(
            r#"{"name":"/dev/sda","maj:min":"8:0","rm":false,"size":1000,"ro":false,"type":"disk","mountpoints":[null]}"#,
        )
        .unwrap();
        let legacy: BlockRecord = serde_json::from_str(
            r#"{"name":"/dev/sda","maj:min":"8:0","rm":"0","size":"1000","ro":"0","type":"disk","mountpoints":[null]}"#,
        )
        .unwrap();
        assert_eq!(modern, legacy);
        assert!(modern.children.is_none());
    }

    #[test]
    fn unknown_device_types_are_other() {
        let record: BlockRecord = serde_json::from_str(
            r#"{"name":"/dev/loop0","maj:min":"7:0","rm":false,"size":4096,"ro":true,"type":"loop","mountpoints":["/snap/core/1"]}"#,
        )
        .unwrap();
        assert_eq!(record.kind, DeviceKind::Other);
    }

    #[test]
    fn active_mount_point_skips_nulls() {
        let device = BlockDevice {
            name: "/dev/sdb1".to_string(),
            major_number: 8,
            minor_number: 17,
            removable: true,
            size_bytes: 0,
            read_only: false,
            kind: DeviceKind::Part,
            mount_points: vec![None, Some("/mnt/BACKUP1".to_string())],
            filesystem_type: None,
            filesystem_version: None,
            label: Some("BACKUP1".to_string()),
            uuid: None,
            children: Vec::new(),
        };
        assert_eq!(device.active_mount_point(), Some("/mnt/BACKUP1"));
        assert!(device.has_label("BACKUP1"));
        assert!(device.is_partition());
    }

    #[test]
    fn active_mount_point_skips_sentinels() {
        let mut device = BlockDevice {
            name: "/dev/sda3".to_string(),
            major_number: 8,
            minor_number: 3,
            removable: false,
            size_bytes: 0,
            read_only: false,
            kind: DeviceKind::Part,
            mount_points: vec![Some("[SWAP]".to_string())],
            filesystem_type: Some("swap".to_string()),
            filesystem_version: None,
            label: Some("BACKUP1".to_string()),
            uuid: None,
            children: Vec::new(),
        };
        assert_eq!(device.active_mount_point(), None);

        device.mount_points.push(Some("/mnt/BACKUP1".to_string()));
        assert_eq!(device.active_mount_point(), Some("/mnt/BACKUP1"));
    }

    #[test]
    fn tool_status_display() {
        assert_eq!(ToolStatus::failed(32).to_string(), "exit code 32");
        assert_eq!(ToolStatus { code: None }.to_string(), "terminated by signal");
        assert!(ToolStatus::SUCCESS.success());
    }
}
