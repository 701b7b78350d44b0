//! Live output streaming for one remote command.
//!
//! Each output stream gets its own drain loop. A loop polls its stream for
//! at most one poll interval per cycle, writes whatever arrived straight
//! through, and stops at end of file or once the command has finished and a
//! poll came back empty. Cancellation is checked once per cycle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use openssh::{Session, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::TransportError;
use crate::core::ExitCode;

const READ_CHUNK: usize = 8192;

/// Exit status of a remote command, mapped onto the local exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Known(ExitCode),
    Unrecognized(i32),
    /// No status code, e.g. the command was killed by a signal.
    Terminated,
}

impl RemoteStatus {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            None => RemoteStatus::Terminated,
            Some(code) => ExitCode::try_from(code)
                .map(RemoteStatus::Known)
                .unwrap_or(RemoteStatus::Unrecognized(code)),
        }
    }

    pub fn message(&self) -> String {
        match self {
            RemoteStatus::Known(code) => code.message().to_string(),
            RemoteStatus::Unrecognized(code) => {
                format!("Remote command exited with unrecognized status {}", code)
            }
            RemoteStatus::Terminated => "Remote command terminated without a status".to_string(),
        }
    }

    /// Local exit code for this status; anything not recognized is an
    /// uncaught failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RemoteStatus::Known(code) => *code,
            _ => ExitCode::UncaughtException,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    pub status: RemoteStatus,
    /// Everything the command wrote to its error stream.
    pub error_text: String,
}

/// Handle on a running command, as seen by the drain loops.
#[async_trait]
pub trait CommandControl: Send + Sync {
    fn is_finished(&self) -> bool;

    /// Ask the command to stop.
    async fn cancel(&self) -> Result<()>;
}

/// Shared between the drain loops of one command: forwards a cancellation
/// request to the command at most once.
pub struct CommandMonitor<C> {
    control: C,
    token: CancellationToken,
    cancel_sent: AtomicBool,
}

impl<C: CommandControl> CommandMonitor<C> {
    pub fn new(control: C, token: CancellationToken) -> Self {
        Self {
            control,
            token,
            cancel_sent: AtomicBool::new(false),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    async fn poll_cancel(&self) {
        if !self.token.is_cancelled() || self.cancel_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cancelling remote command");
        if let Err(e) = self.control.cancel().await {
            warn!(error = %e, "Failed to cancel remote command");
        }
    }
}

/// Copy `reader` to `writer` until end of file, or until the command has
/// finished and a poll yields nothing. Bytes are also appended to `capture`.
pub async fn drain<R, W, C>(
    mut reader: R,
    mut writer: W,
    monitor: &CommandMonitor<C>,
    poll_interval: Duration,
    mut capture: Option<&mut Vec<u8>>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    C: CommandControl,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        monitor.poll_cancel().await;
        let finished = monitor.is_finished();

        match timeout(poll_interval, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                if let Some(capture) = capture.as_deref_mut() {
                    capture.extend_from_slice(&buf[..n]);
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) if finished => break,
            Err(_) => {}
        }
    }
    Ok(())
}

/// Control for a command started through [`execute`].
pub struct RemoteControl {
    session: Arc<Session>,
    pid: Option<u32>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl CommandControl for RemoteControl {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn cancel(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            anyhow::bail!("remote pid is unknown");
        };
        let status = self
            .session
            .clone()
            .arc_command("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await
            .context("Failed to run kill on the remote host")?;
        debug!(pid, ?status, "Sent SIGTERM to remote command");
        Ok(())
    }
}

/// Run `command` on `session`, streaming its output to the local console.
pub async fn execute(
    session: Arc<Session>,
    command: &str,
    token: CancellationToken,
    poll_interval: Duration,
) -> Result<RemoteOutcome, TransportError> {
    execute_with(
        session,
        command,
        token,
        poll_interval,
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}

async fn execute_with<O, E>(
    session: Arc<Session>,
    command: &str,
    token: CancellationToken,
    poll_interval: Duration,
    out: O,
    err: E,
) -> Result<RemoteOutcome, TransportError>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    debug!(command, "Starting remote command");
    let mut child = session
        .clone()
        .arc_command("sh")
        .arg("-c")
        .arg(format!("echo $$; exec {}", command))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .await
        .map_err(|e| TransportError::Session(format!("failed to start remote command: {}", e)))?;

    let stdout = child
        .stdout()
        .take()
        .ok_or_else(|| TransportError::Session("remote stdout was not piped".to_string()))?;
    let stderr = child
        .stderr()
        .take()
        .ok_or_else(|| TransportError::Session("remote stderr was not piped".to_string()))?;

    let mut stdout = BufReader::new(stdout);
    let pid = read_pid(&mut stdout).await;
    if pid.is_none() {
        warn!("Remote command did not report its pid; cancellation is unavailable");
    }

    let finished = Arc::new(AtomicBool::new(false));
    let waiter = {
        let finished = finished.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            finished.store(true, Ordering::SeqCst);
            status
        })
    };

    let monitor = CommandMonitor::new(
        RemoteControl {
            session,
            pid,
            finished,
        },
        token,
    );

    let mut error_bytes = Vec::new();
    let (out_result, err_result) = tokio::join!(
        drain(stdout, out, &monitor, poll_interval, None),
        drain(stderr, err, &monitor, poll_interval, Some(&mut error_bytes)),
    );
    out_result.map_err(|e| TransportError::Session(format!("remote stdout failed: {}", e)))?;
    err_result.map_err(|e| TransportError::Session(format!("remote stderr failed: {}", e)))?;

    let status = waiter
        .await
        .map_err(|e| TransportError::Session(format!("remote waiter failed: {}", e)))?
        .map_err(|e| TransportError::Session(format!("failed to wait for remote command: {}", e)))?;

    let status = RemoteStatus::from_code(status.code());
    debug!(%status, "Remote command finished");
    Ok(RemoteOutcome {
        status,
        error_text: String::from_utf8_lossy(&error_bytes).into_owned(),
    })
}

/// The wrapper script prints the remote shell pid as its first line.
async fn read_pid<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<u32> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(n) if n > 0 => line.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeControl {
        finished: AtomicBool,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl CommandControl for FakeControl {
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }

        async fn cancel(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn copies_until_end_of_file() {
        let (mut remote, local) = tokio::io::duplex(64);
        let monitor = CommandMonitor::new(FakeControl::default(), CancellationToken::new());

        remote.write_all(b"hello ").await.unwrap();
        remote.write_all(b"world").await.unwrap();
        drop(remote);

        let mut console = Vec::new();
        let mut captured = Vec::new();
        drain(local, &mut console, &monitor, POLL, Some(&mut captured))
            .await
            .unwrap();

        assert_eq!(console, b"hello world");
        assert_eq!(captured, b"hello world");
    }

    #[tokio::test]
    async fn stops_when_finished_and_idle() {
        let (_remote, local) = tokio::io::duplex(64);
        let control = FakeControl::default();
        control.finished.store(true, Ordering::SeqCst);
        let monitor = CommandMonitor::new(control, CancellationToken::new());

        let result = timeout(
            Duration::from_secs(5),
            drain(local, tokio::io::sink(), &monitor, POLL, None),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancellation_is_sent_once_and_both_loops_end() {
        let (_out_remote, out_local) = tokio::io::duplex(64);
        let (_err_remote, err_local) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let monitor = CommandMonitor::new(FakeControl::default(), token.clone());

        token.cancel();
        let both = async {
            tokio::join!(
                drain(out_local, tokio::io::sink(), &monitor, POLL, None),
                drain(err_local, tokio::io::sink(), &monitor, POLL, None),
            )
        };
        let (out, err) = timeout(Duration::from_secs(5), both).await.unwrap();

        out.unwrap();
        err.unwrap();
        assert_eq!(monitor.control().cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reads_pid_line_before_output() {
        let (mut remote, local) = tokio::io::duplex(64);
        remote.write_all(b"4242\nlisting\n").await.unwrap();
        drop(remote);

        let mut reader = BufReader::new(local);
        assert_eq!(read_pid(&mut reader).await, Some(4242));

        let monitor = CommandMonitor::new(FakeControl::default(), CancellationToken::new());
        let mut console = Vec::new();
        drain(reader, &mut console, &monitor, POLL, None).await.unwrap();
        assert_eq!(console, b"listing\n");
    }

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(
            RemoteStatus::from_code(Some(0)),
            RemoteStatus::Known(ExitCode::Ok)
        );
        assert_eq!(
            RemoteStatus::from_code(Some(16)),
            RemoteStatus::Known(ExitCode::BadDestinationLabel)
        );
        assert_eq!(RemoteStatus::from_code(Some(7)), RemoteStatus::Unrecognized(7));
        assert_eq!(RemoteStatus::from_code(None), RemoteStatus::Terminated);

        assert_eq!(
            RemoteStatus::Unrecognized(7).exit_code(),
            ExitCode::UncaughtException
        );
        assert!(RemoteStatus::Unrecognized(7).message().contains('7'));
        assert!(!RemoteStatus::Terminated.message().is_empty());
    }
}
