use serde::{Deserialize, Serialize};

/// One line of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device path, or dataset name for pooled filesystems.
    pub device_name: String,
    pub mount_path: String,
    pub filesystem_type: String,
    pub raw_options: String,
}

/// Arguments of a single copy workflow invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_name: Option<String>,
    pub destination_label: Option<String>,
    pub force_kill: bool,
}

/// Valid alternatives printed when a source or destination cannot be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptableValues {
    pub acceptable_destination_labels: Vec<String>,
    pub acceptable_source_names: Vec<String>,
}
