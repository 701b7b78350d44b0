pub mod exit_code;
pub mod hardware;
pub mod inventory;
pub mod lock;
pub mod models;
pub mod mounts;
pub mod orchestrator;
pub mod transfer_engine;

pub use exit_code::ExitCode;
pub use hardware::{BlockDevice, DeviceKind, HardwareAdapter, ToolStatus};
pub use inventory::DeviceInventory;
pub use lock::SingleInstanceLock;
pub use models::{AcceptableValues, CopyRequest, MountEntry};
pub use mounts::MountTable;
pub use orchestrator::{CopyOutcome, Orchestrator};
