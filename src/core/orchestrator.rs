//! The copy workflow: resolve source and destination, take the host lock,
//! mount if needed, sync, unmount.
//!
//! Each state either advances to the next one or ends the run with a single
//! [`ExitCode`]. The lock handle lives in the workflow state, so it is
//! released on every path out of the state machine once acquired.
//!
//! Cancellation is checked between states. Before the lock is taken the run
//! simply stops; after that it still unmounts and releases the lock, and an
//! in-flight sync is stopped and reaped first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::exit_code::ExitCode;
use crate::core::hardware::BlockDevice;
use crate::core::inventory::DeviceInventory;
use crate::core::lock::{LockHandle, SingleInstanceLock};
use crate::core::models::{AcceptableValues, CopyRequest, MountEntry};
use crate::core::mounts::MountTable;
use crate::core::transfer_engine::{SyncError, TransferRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    ValidateArgs,
    CheckLock,
    ResolveSource,
    ResolveDestination,
    AcquireLock,
    ResolveOrCreateMountPoint,
    Sync,
    Unmount,
    Done,
}

/// Final result of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub code: ExitCode,
    /// Valid alternatives when the source or destination could not be resolved.
    pub acceptable: Option<AcceptableValues>,
}

impl CopyOutcome {
    fn code(code: ExitCode) -> Self {
        Self {
            code,
            acceptable: None,
        }
    }
}

/// Values gathered while moving through the states.
#[derive(Default)]
struct Workflow {
    source_name: String,
    destination_label: String,
    source_path: PathBuf,
    destination: Option<BlockDevice>,
    lock: Option<LockHandle>,
    mount_point: Option<PathBuf>,
    result: Option<ExitCode>,
    interrupted: bool,
}

pub struct Orchestrator {
    ctx: AppContext,
    inventory: DeviceInventory,
    mounts: MountTable,
    lock: SingleInstanceLock,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let inventory = DeviceInventory::new(ctx.adapter.clone());
        let mounts = MountTable::new(ctx.adapter.clone(), ctx.config.unmount_retry_interval());
        let lock = SingleInstanceLock::new(ctx.config.lock_path.clone());
        Self {
            ctx,
            inventory,
            mounts,
            lock,
        }
    }

    fn mount_root(&self) -> &Path {
        &self.ctx.config.mount_root
    }

    /// Run the workflow to completion.
    ///
    /// Errors are infrastructure failures (a device or mount query that could
    /// not run, a lock file that could not be written); every expected failure
    /// is reported through the outcome's exit code.
    pub async fn run(
        &mut self,
        request: &CopyRequest,
        cancel: CancellationToken,
    ) -> Result<CopyOutcome> {
        let mut flow = Workflow::default();
        let mut state = CopyState::ValidateArgs;

        loop {
            if cancel.is_cancelled() && !flow.interrupted {
                flow.interrupted = true;
                warn!(?state, "Copy workflow interrupted");
                state = match state {
                    CopyState::ValidateArgs
                    | CopyState::CheckLock
                    | CopyState::ResolveSource
                    | CopyState::ResolveDestination
                    | CopyState::AcquireLock => {
                        return Ok(CopyOutcome::code(ExitCode::UncaughtException));
                    }
                    CopyState::ResolveOrCreateMountPoint => CopyState::Done,
                    CopyState::Sync => CopyState::Unmount,
                    CopyState::Unmount | CopyState::Done => state,
                };
                if flow.result.is_none() {
                    flow.result = Some(ExitCode::UncaughtException);
                }
            }

            debug!(?state, "Copy workflow transition");
            state = match state {
                CopyState::ValidateArgs => {
                    let source = request.source_name.as_deref().filter(|s| !s.is_empty());
                    let label = request.destination_label.as_deref().filter(|s| !s.is_empty());
                    match (source, label) {
                        (Some(source), Some(label)) => {
                            flow.source_name = source.to_string();
                            flow.destination_label = label.to_string();
                            CopyState::CheckLock
                        }
                        (source, _) => {
                            let missing = if source.is_none() {
                                "--source-name"
                            } else {
                                "--destination-device-label"
                            };
                            error!(missing, "Missing required argument");
                            return Ok(CopyOutcome::code(ExitCode::ArgumentOrCliIssue));
                        }
                    }
                }

                CopyState::CheckLock => {
                    if self.lock.is_locked(request.force_kill) {
                        error!(
                            path = %self.lock.path().display(),
                            "Another copy is already running; pass --force-kill to stop it"
                        );
                        return Ok(CopyOutcome::code(ExitCode::ProcessAlreadyRunning));
                    }
                    CopyState::ResolveSource
                }

                CopyState::ResolveSource => {
                    let mounts = self
                        .mounts
                        .list_mounts()
                        .await
                        .context("Failed to read the mount table")?;
                    let eligible = eligible_sources(&mounts, self.mount_root());

                    match eligible.iter().find(|m| m.device_name == flow.source_name) {
                        Some(entry) => {
                            info!(source = %flow.source_name, path = %entry.mount_path, "Resolved source dataset");
                            flow.source_path = PathBuf::from(&entry.mount_path);
                            CopyState::ResolveDestination
                        }
                        None => {
                            let names: Vec<String> =
                                eligible.iter().map(|m| m.device_name.clone()).collect();
                            error!(
                                source = %flow.source_name,
                                mount_root = %self.mount_root().display(),
                                candidates = ?names,
                                "Source dataset is not mounted under the managed mount root"
                            );
                            return Ok(CopyOutcome {
                                code: ExitCode::BadSourceDataSet,
                                acceptable: Some(AcceptableValues {
                                    acceptable_destination_labels: Vec::new(),
                                    acceptable_source_names: names,
                                }),
                            });
                        }
                    }
                }

                CopyState::ResolveDestination => {
                    self.inventory
                        .refresh()
                        .await
                        .context("Failed to read the device inventory")?;
                    let label = flow.destination_label.as_str();
                    let matches = self
                        .inventory
                        .find(|d| d.has_label(label) && d.is_partition())?;

                    match matches.as_slice() {
                        [] => {
                            let labels = partition_labels(&self.inventory)?;
                            error!(label = %label, candidates = ?labels, "No partition carries the destination label");
                            return Ok(CopyOutcome {
                                code: ExitCode::BadDestinationLabel,
                                acceptable: Some(AcceptableValues {
                                    acceptable_destination_labels: labels,
                                    acceptable_source_names: Vec::new(),
                                }),
                            });
                        }
                        [first, rest @ ..] => {
                            if !rest.is_empty() {
                                let others: Vec<&str> = rest.iter().map(|d| d.name.as_str()).collect();
                                warn!(label = %label, using = %first.name, ignored = ?others, "Label is not unique");
                            }
                            info!(label = %label, device = %first.name, "Resolved destination partition");
                            flow.destination = Some((*first).clone());
                            CopyState::AcquireLock
                        }
                    }
                }

                CopyState::AcquireLock => {
                    flow.lock = Some(self.lock.acquire().context("Failed to acquire copy lock")?);
                    CopyState::ResolveOrCreateMountPoint
                }

                CopyState::ResolveOrCreateMountPoint => {
                    let existing = flow
                        .destination
                        .as_ref()
                        .and_then(|d| d.active_mount_point())
                        .map(PathBuf::from);

                    match existing {
                        Some(path) => {
                            info!(path = %path.display(), "Destination already mounted");
                            flow.mount_point = Some(path);
                        }
                        None => {
                            let target = self.mount_root().join(sanitize_label(&flow.destination_label));
                            info!(label = %flow.destination_label, path = %target.display(), "Attempting to mount");
                            if let Err(e) = self.mounts.mount(&flow.destination_label, &target).await {
                                error!(error = %e, "Failed to mount {} to {}", flow.destination_label, target.display());
                                return Ok(CopyOutcome::code(ExitCode::MountFailure));
                            }
                            flow.mount_point = Some(target);
                        }
                    }
                    CopyState::Sync
                }

                CopyState::Sync => {
                    let Some(destination) = flow.mount_point.clone() else {
                        return Ok(CopyOutcome::code(ExitCode::MountFailure));
                    };
                    let req = TransferRequest {
                        source: flow.source_path.clone(),
                        destination,
                    };
                    flow.result = Some(match self.ctx.engine.transfer(&req, cancel.clone()).await {
                        Ok(result) => {
                            info!(duration_secs = result.duration_secs, "Sync complete");
                            ExitCode::Ok
                        }
                        Err(SyncError::Cancelled) => {
                            warn!("Sync stopped before completion");
                            ExitCode::UncaughtException
                        }
                        Err(e) => {
                            error!(error = %e, "Sync failed");
                            ExitCode::SyncFailure
                        }
                    });
                    CopyState::Unmount
                }

                CopyState::Unmount => {
                    if let Some(mount_point) = &flow.mount_point {
                        // A stuck unmount must never mask the sync result.
                        if let Err(e) = self.mounts.unmount(mount_point).await {
                            warn!(path = %mount_point.display(), error = %e, "Unmount failed");
                        }
                    }
                    CopyState::Done
                }

                CopyState::Done => {
                    if let Some(handle) = flow.lock.take() {
                        handle.release();
                    }
                    let code = flow.result.unwrap_or(ExitCode::Ok);
                    info!(%code, "Copy workflow finished");
                    return Ok(CopyOutcome::code(code));
                }
            };
        }
    }
}

/// Mounts that may serve as a copy source: only those under the managed root.
fn eligible_sources<'a>(mounts: &'a [MountEntry], mount_root: &Path) -> Vec<&'a MountEntry> {
    mounts
        .iter()
        .filter(|m| Path::new(&m.mount_path).starts_with(mount_root))
        .collect()
}

fn partition_labels(inventory: &DeviceInventory) -> Result<Vec<String>> {
    Ok(inventory
        .find(|d| d.is_partition())?
        .into_iter()
        .filter_map(|d| d.label.clone())
        .collect())
}

/// Filesystem-safe directory name for a label: ASCII letters and digits are
/// kept, anything else becomes its decimal code point.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_string()
            } else {
                u32::from(c).to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_clean_labels() {
        assert_eq!(sanitize_label("BACKUP1"), "BACKUP1");
    }

    #[test]
    fn sanitize_replaces_other_characters_with_code_points() {
        assert_eq!(sanitize_label("B@CKUP 1"), "B64CKUP321");
        assert_eq!(sanitize_label("../x"), "464647x");
        assert_eq!(sanitize_label("é"), "233");
    }

    #[test]
    fn eligible_sources_are_under_root() {
        let entry = |name: &str, path: &str| MountEntry {
            device_name: name.to_string(),
            mount_path: path.to_string(),
            filesystem_type: "zfs".to_string(),
            raw_options: String::new(),
        };
        let mounts = vec![
            entry("/dev/sda2", "/"),
            entry("myFiles", "/mnt/myFiles"),
            entry("tank", "/mntx/tank"),
        ];
        let eligible = eligible_sources(&mounts, Path::new("/mnt"));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].device_name, "myFiles");
    }
}
