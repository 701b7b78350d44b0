use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::channel::{RemoteOutcome, execute};
use super::session::{SshTarget, connect};
use crate::core::models::CopyRequest;

static SERVER_BINARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9/._-]+$").expect("server binary pattern is valid")
});

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("server binary path {0:?} contains disallowed characters")]
    UnsafeServerBinary(String),

    #[error("{what} {value:?} contains a quote character")]
    UnsafeArgument { what: &'static str, value: String },

    #[error("{0} is required")]
    MissingArgument(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    List { label: Option<String> },
    Copy(CopyRequest),
}

/// Runs `list` and `copy` on a remote host through the server binary.
pub struct NasClient {
    target: SshTarget,
    server_binary: String,
    poll_interval: Duration,
}

impl NasClient {
    pub fn new(target: SshTarget, server_binary: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            target,
            server_binary: server_binary.into(),
            poll_interval,
        }
    }

    /// The command line run by the remote shell.
    pub fn invocation(&self, command: &RemoteCommand) -> Result<String, InvocationError> {
        if !SERVER_BINARY.is_match(&self.server_binary) {
            return Err(InvocationError::UnsafeServerBinary(self.server_binary.clone()));
        }

        let mut line = self.server_binary.clone();
        match command {
            RemoteCommand::List { label } => {
                line.push_str(" list");
                if let Some(label) = label {
                    line.push_str(" --label ");
                    line.push_str(&quote("label", label)?);
                }
            }
            RemoteCommand::Copy(request) => {
                let source = request
                    .source_name
                    .as_deref()
                    .ok_or(InvocationError::MissingArgument("--source-name"))?;
                let label = request
                    .destination_label
                    .as_deref()
                    .ok_or(InvocationError::MissingArgument("--destination-device-label"))?;
                line.push_str(" copy --source-name ");
                line.push_str(&quote("source name", source)?);
                line.push_str(" --destination-device-label ");
                line.push_str(&quote("destination label", label)?);
                if request.force_kill {
                    line.push_str(" --force-kill");
                }
            }
        }
        Ok(line)
    }

    pub async fn run(
        &self,
        command: &RemoteCommand,
        token: CancellationToken,
    ) -> anyhow::Result<RemoteOutcome> {
        let line = self.invocation(command)?;
        let session = connect(&self.target).await?;
        info!(host = %self.target.host, command = %line, "Running remote command");
        let outcome = execute(session, &line, token, self.poll_interval).await?;
        Ok(outcome)
    }
}

/// Single-quote an operator-supplied value for the remote shell.
fn quote(what: &'static str, value: &str) -> Result<String, InvocationError> {
    if value.contains(['\'', '"']) {
        return Err(InvocationError::UnsafeArgument {
            what,
            value: value.to_string(),
        });
    }
    Ok(format!("'{}'", value))
}
