use crate::core::hardware::ToolStatus;
use crate::core::transfer_engine::{SyncError, TransferEngine, TransferRequest, TransferResult};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Transfer engine that only records requests, for simulation and tests.
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    requests: Arc<Mutex<Vec<TransferRequest>>>,
    failure: Option<i32>,
    delay: Duration,
}

impl SimulatedEngine {
    /// Every transfer fails with the given rsync exit code.
    pub fn failing(code: i32) -> Self {
        Self {
            failure: Some(code),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TransferEngine for SimulatedEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult, SyncError>> + Send>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req.clone());
        }
        let req = req.clone();
        let failure = self.failure;
        let delay = self.delay;

        Box::pin(async move {
            info!(
                source = %req.source.display(),
                destination = %req.destination.display(),
                "(Simulated) Transferring"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    info!("(Simulated) Transfer cancelled");
                    return Err(SyncError::Cancelled);
                }
            }

            match failure {
                Some(code) => Err(SyncError::Failed {
                    status: ToolStatus::failed(code),
                    log_file: PathBuf::from("/dev/null"),
                }),
                None => Ok(TransferResult {
                    duration_secs: delay.as_secs(),
                }),
            }
        })
    }
}
