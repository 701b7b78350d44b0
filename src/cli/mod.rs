//! Subcommand handlers. Each returns the exit code for the process; stdout
//! carries only command output.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::inventory::DeviceInventory;
use crate::core::{ExitCode, Orchestrator};
use crate::remote::{InvocationError, NasClient, RemoteCommand, SshTarget, TransportError};

/// Print the device forest, or the first device carrying `label`.
pub async fn run_list(ctx: &AppContext, label: Option<&str>) -> Result<ExitCode> {
    let mut inventory = DeviceInventory::new(ctx.adapter.clone());
    inventory
        .refresh()
        .await
        .context("Failed to read the device inventory")?;

    match label {
        None => print_json(&inventory.devices()?)?,
        Some(label) => {
            let matches = inventory.find(|d| d.has_label(label))?;
            let Some(device) = matches.first() else {
                error!(label = %label, "No device carries this label");
                return Ok(ExitCode::BadDestinationLabel);
            };
            print_json(device)?;
        }
    }
    Ok(ExitCode::Ok)
}

/// Run the copy workflow to completion.
///
/// Ctrl-C or SIGTERM cancels the workflow, which still stops the sync,
/// unmounts and releases the lock before returning.
pub async fn run_copy(ctx: AppContext, request: crate::core::CopyRequest) -> Result<ExitCode> {
    let mut orchestrator = Orchestrator::new(ctx);

    let token = CancellationToken::new();
    let canceller = spawn_canceller(token.clone(), "Interrupted; stopping copy workflow");
    let outcome = orchestrator.run(&request, token).await;
    canceller.abort();

    let outcome = outcome?;
    if let Some(acceptable) = &outcome.acceptable {
        print_json(acceptable)?;
    }
    if outcome.code != ExitCode::Ok {
        error!(code = %outcome.code, "{}", outcome.code.message());
    }
    Ok(outcome.code)
}

/// Run `command` on a remote host and adopt its exit status.
pub async fn run_remote(
    ctx: &AppContext,
    target: SshTarget,
    server_binary: Option<String>,
    command: RemoteCommand,
) -> Result<ExitCode> {
    let server_binary = server_binary.unwrap_or_else(|| ctx.config.server_binary.clone());
    let client = NasClient::new(target, server_binary, ctx.config.poll_interval());

    let token = CancellationToken::new();
    let canceller = spawn_canceller(token.clone(), "Interrupted; cancelling remote command");
    let result = client.run(&command, token).await;
    canceller.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(invalid) = e.downcast_ref::<InvocationError>() {
                error!(error = %invalid, "Invalid remote invocation");
                return Ok(ExitCode::ArgumentOrCliIssue);
            }
            match e.downcast_ref::<TransportError>() {
                Some(TransportError::Authentication { destination, .. }) => {
                    error!(destination = %destination, "SSH authentication failed")
                }
                Some(TransportError::Connect { destination, .. }) => {
                    error!(destination = %destination, "Could not reach remote host")
                }
                Some(TransportError::Session(detail)) => {
                    error!(detail = %detail, "SSH session failed")
                }
                None => return Err(e),
            }
            return Ok(ExitCode::UncaughtException);
        }
    };

    let code = outcome.status.exit_code();
    if code == ExitCode::Ok {
        info!("Remote command succeeded");
    } else {
        let error_text = outcome.error_text.trim();
        error!(status = %outcome.status, error_text = %error_text, "Remote command failed");
    }
    Ok(code)
}

/// Cancel `token` on the first Ctrl-C or SIGTERM.
fn spawn_canceller(token: CancellationToken, message: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("{}", message);
        token.cancel();
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", json);
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
