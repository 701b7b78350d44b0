pub mod rsync;
pub mod simulated;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::hardware::ToolStatus;

pub use rsync::RsyncEngine;
pub use simulated::SimulatedEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub duration_secs: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("refusing to sync unsafe path {0:?}")]
    UnsafePath(String),

    #[error("failed to spawn sync process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("sync exited with {status}; log file located at {}", log_file.display())]
    Failed { status: ToolStatus, log_file: PathBuf },

    #[error("sync was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngineType {
    Rsync,
    Simulated,
}

pub trait TransferEngine: Send + Sync {
    /// Copy the contents of `req.source` onto `req.destination`.
    ///
    /// When `cancel` fires, the sync process is stopped and reaped before the
    /// future resolves with [`SyncError::Cancelled`].
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult, SyncError>> + Send>>;
}

pub fn create_engine(engine_type: TransferEngineType, log_file: PathBuf) -> Box<dyn TransferEngine> {
    match engine_type {
        TransferEngineType::Rsync => Box::new(RsyncEngine::new(log_file)),
        TransferEngineType::Simulated => Box::new(SimulatedEngine::default()),
    }
}
