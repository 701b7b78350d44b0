use crate::core::transfer_engine::{SyncError, TransferEngine, TransferRequest, TransferResult};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_LOG_FILE: &str = "/var/log/rsync.log";

static SAFE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9/]+$").expect("static regex"));

/// Runs `rsync --archive` with its own log file.
pub struct RsyncEngine {
    program: PathBuf,
    log_file: PathBuf,
}

impl Default for RsyncEngine {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_LOG_FILE))
    }
}

impl RsyncEngine {
    pub fn new(log_file: PathBuf) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            log_file,
        }
    }

    /// Run `program` in place of the `rsync` found on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments passed to rsync, after validation of both paths.
    pub fn build_args(&self, req: &TransferRequest) -> Result<Vec<String>, SyncError> {
        let source = checked_path(&req.source)?;
        let destination = checked_path(&req.destination)?;

        Ok(vec![
            "--verbose".to_string(),
            format!("--log-file={}", self.log_file.display()),
            "--archive".to_string(),
            source,
            destination,
        ])
    }
}

fn checked_path(path: &std::path::Path) -> Result<String, SyncError> {
    let text = path.to_string_lossy().into_owned();
    if !SAFE_PATH.is_match(&text) {
        return Err(SyncError::UnsafePath(text));
    }
    Ok(text)
}

impl TransferEngine for RsyncEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult, SyncError>> + Send>> {
        let args = self.build_args(req);
        let program = self.program.clone();
        let log_file = self.log_file.clone();
        let req = req.clone();

        Box::pin(async move {
            let args = args?;
            let start_time = Instant::now();

            info!(
                source = %req.source.display(),
                destination = %req.destination.display(),
                log_file = %log_file.display(),
                "Starting rsync"
            );

            // Output goes straight to our console so a remote operator sees it live.
            let mut child = Command::new(&program)
                .args(&args)
                .process_group(0)
                .kill_on_drop(true)
                .spawn()
                .map_err(SyncError::Spawn)?;

            let status = tokio::select! {
                status = child.wait() => status.map_err(SyncError::Spawn)?,
                _ = cancel.cancelled() => {
                    // rsync forks its own helpers; they share the child's process group.
                    if let Some(pid) = child.id() {
                        warn!(pid, "Stopping rsync");
                        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                            warn!(pid, error = %e, "Failed to signal rsync process group");
                        }
                    }
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to stop rsync");
                    }
                    return Err(SyncError::Cancelled);
                }
            };

            if !status.success() {
                error!(%status, log_file = %log_file.display(), "Rsync failed");
                return Err(SyncError::Failed {
                    status: status.into(),
                    log_file,
                });
            }

            let duration_secs = start_time.elapsed().as_secs();
            info!(duration_secs, "Rsync finished");
            Ok(TransferResult { duration_secs })
        })
    }
}
