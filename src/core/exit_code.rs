//! Process exit codes of the `copy` workflow.
//!
//! The integer values are part of the wire contract between the remote
//! client and the server binary and must never change.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    UncaughtException = 1,
    ArgumentOrCliIssue = 4,
    ProcessAlreadyRunning = 8,
    BadSourceDataSet = 12,
    BadDestinationLabel = 16,
    MountFailure = 24,
    SyncFailure = 32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unrecognized exit code {0}")]
pub struct UnrecognizedExitCode(pub i32);

impl ExitCode {
    pub const ALL: [ExitCode; 8] = [
        ExitCode::Ok,
        ExitCode::UncaughtException,
        ExitCode::ArgumentOrCliIssue,
        ExitCode::ProcessAlreadyRunning,
        ExitCode::BadSourceDataSet,
        ExitCode::BadDestinationLabel,
        ExitCode::MountFailure,
        ExitCode::SyncFailure,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Operator-facing explanation of the outcome.
    pub fn message(self) -> &'static str {
        match self {
            ExitCode::Ok => "Copy completed successfully",
            ExitCode::UncaughtException => "The copy process failed with an unexpected error",
            ExitCode::ArgumentOrCliIssue => "Invalid or missing command-line arguments",
            ExitCode::ProcessAlreadyRunning => "Another copy is already running on the host",
            ExitCode::BadSourceDataSet => "The source dataset is not mounted under the managed mount root",
            ExitCode::BadDestinationLabel => "No partition carries the destination label",
            ExitCode::MountFailure => "The destination partition could not be mounted",
            ExitCode::SyncFailure => "Synchronization failed, see the rsync log on the host",
        }
    }
}

impl TryFrom<i32> for ExitCode {
    type Error = UnrecognizedExitCode;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        ExitCode::ALL
            .into_iter()
            .find(|candidate| candidate.code() == code)
            .ok_or(UnrecognizedExitCode(code))
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // All values fit in a u8.
        std::process::ExitCode::from(code.code() as u8)
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
