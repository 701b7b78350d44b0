//! Running this tool on a remote NAS over SSH.
//!
//! The server side is the same binary; the client connects, starts one
//! command line, streams both output streams to the local console and maps
//! the remote exit status back onto [`ExitCode`](crate::core::ExitCode).

pub mod channel;
pub mod client;
pub mod session;

pub use channel::{CommandControl, CommandMonitor, RemoteOutcome, RemoteStatus, execute};
pub use client::{InvocationError, NasClient, RemoteCommand};
pub use session::{SshTarget, TransportError, connect};
