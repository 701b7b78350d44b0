//! Host-wide single-instance lock backed by a pid file.
//!
//! Mutual exclusion comes solely from exclusive file creation. A record whose
//! process is no longer running is stale and gets discarded, so a lock left
//! behind by a crashed run never blocks the next one.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LOCK_PATH: &str = "/run/lock/LCK.NasFileCopy";

/// Owner read/write, group read/write.
const LOCK_FILE_MODE: u32 = 0o660;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {0} already exists")]
    LockAlreadyHeld(PathBuf),

    #[error("failed to write lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode lock record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SingleInstanceLock {
    path: PathBuf,
}

impl Default for SingleInstanceLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_PATH)
    }
}

impl SingleInstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether another live workflow holds the lock.
    ///
    /// Stale records are deleted. With `kill_if_present`, a live owner and its
    /// descendants are killed and the record removed, leaving the lock free.
    pub fn is_locked(&self, kill_if_present: bool) -> bool {
        let Some(record) = self.read_record() else {
            return false;
        };

        let own_pid = std::process::id() as i32;
        if record.pid == own_pid || !process_alive(record.pid) {
            info!(pid = record.pid, path = %self.path.display(), "Found stale lock file, process is not running");
            self.delete_record();
            return false;
        }

        if !kill_if_present {
            debug!(pid = record.pid, since = ?record.acquired_at, "Lock held by running process");
            return true;
        }

        warn!(pid = record.pid, "Killing process holding the copy lock");
        kill_process_tree(record.pid);
        self.delete_record();
        false
    }

    /// Create the lock file for the current process.
    ///
    /// Does not check liveness: call [`is_locked`](Self::is_locked) first to
    /// clear stale records.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        let record = LockRecord {
            pid: std::process::id() as i32,
            acquired_at: Some(Utc::now()),
        };
        let contents = serde_json::to_string_pretty(&record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(LOCK_FILE_MODE)
            .open(&self.path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => LockError::LockAlreadyHeld(self.path.clone()),
                _ => LockError::Io {
                    path: self.path.clone(),
                    source,
                },
            })?;

        // From here on the handle owns the file, so a failed write still cleans up.
        let handle = LockHandle {
            path: self.path.clone(),
            released: false,
        };
        writeln!(file, "{}", contents).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;

        info!(pid = record.pid, path = %self.path.display(), "Acquired copy lock");
        Ok(handle)
    }

    /// Read the record; unreadable or unparsable files count as stale.
    fn read_record(&self) -> Option<LockRecord> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read lock file, treating as stale");
                self.delete_record();
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse lock file, treating as stale");
                self.delete_record();
                None
            }
        }
    }

    fn delete_record(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Lock file exists but could not be deleted");
                false
            }
        }
    }
}

/// Scoped ownership of the lock file; deletes it when dropped.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Released copy lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Check a pid with signal 0. `EPERM` means the process exists but belongs
/// to someone else.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGKILL `pid` and every process descending from it.
fn kill_process_tree(pid: i32) {
    // Collect descendants first; once the parent dies they are re-parented.
    let mut targets = vec![pid];
    targets.extend(descendants(pid));

    for target in targets {
        match signal::kill(Pid::from_raw(target), Signal::SIGKILL) {
            Ok(()) => debug!(pid = target, "Sent SIGKILL"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = target, error = %e, "Failed to kill process"),
        }
    }
}

#[cfg(target_os = "linux")]
fn descendants(root: i32) -> Vec<i32> {
    let processes = match procfs::process::all_processes() {
        Ok(iter) => iter,
        Err(e) => {
            warn!(error = %e, "Could not enumerate processes, killing lock owner only");
            return Vec::new();
        }
    };

    let parents: Vec<(i32, i32)> = processes
        .filter_map(|p| p.ok())
        .filter_map(|p| p.stat().ok())
        .map(|stat| (stat.pid, stat.ppid))
        .collect();

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(child, ppid) in &parents {
            if ppid == parent && !found.contains(&child) {
                found.push(child);
                frontier.push(child);
            }
        }
    }
    found
}

#[cfg(not(target_os = "linux"))]
fn descendants(_root: i32) -> Vec<i32> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn lock_in(dir: &tempfile::TempDir) -> SingleInstanceLock {
        SingleInstanceLock::new(dir.path().join("LCK.test"))
    }

    fn write_record(lock: &SingleInstanceLock, pid: i32) {
        let record = LockRecord {
            pid,
            acquired_at: None,
        };
        std::fs::write(lock.path(), serde_json::to_string(&record).unwrap()).unwrap();
    }

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn acquire_without_file_succeeds_and_release_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);

        let handle = lock.acquire().unwrap();
        let text = std::fs::read_to_string(lock.path()).unwrap();
        let record: LockRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(record.pid, std::process::id() as i32);
        assert!(record.acquired_at.is_some());

        handle.release();
        assert!(!lock.path().exists());
    }

    #[test]
    fn lock_file_is_group_read_write_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let _handle = lock.acquire().unwrap();

        let mode = std::fs::metadata(lock.path()).unwrap().permissions().mode() & 0o777;
        // The process umask may only remove bits.
        assert_eq!(mode & !LOCK_FILE_MODE, 0);
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        {
            let _handle = lock.acquire().unwrap();
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());
    }

    #[test]
    fn acquire_with_live_owner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let mut sleeper = spawn_sleeper();
        write_record(&lock, sleeper.id() as i32);

        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, LockError::LockAlreadyHeld(_)));
        assert!(lock.path().exists());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
    }

    #[test]
    fn is_locked_without_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!lock_in(&dir).is_locked(false));
    }

    #[test]
    fn is_locked_discards_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        // Beyond any pid_max.
        write_record(&lock, 999_999_999);

        assert!(!lock.is_locked(false));
        assert!(!lock.path().exists());
    }

    #[test]
    fn is_locked_discards_garbage_record() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        std::fs::write(lock.path(), "not json").unwrap();

        assert!(!lock.is_locked(false));
        assert!(!lock.path().exists());
    }

    #[test]
    fn is_locked_reports_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let mut sleeper = spawn_sleeper();
        write_record(&lock, sleeper.id() as i32);

        assert!(lock.is_locked(false));
        assert!(lock.path().exists());

        sleeper.kill().unwrap();
        sleeper.wait().unwrap();
    }

    #[test]
    fn is_locked_kills_live_owner_when_forced() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir);
        let mut sleeper = spawn_sleeper();
        write_record(&lock, sleeper.id() as i32);

        assert!(!lock.is_locked(true));
        assert!(!lock.path().exists());

        let status = sleeper.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn process_alive_check() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(999_999_999));
    }
}
