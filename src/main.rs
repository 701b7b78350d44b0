use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, error::ErrorKind};
use nasfilecopy::core::{CopyRequest, ExitCode};
use nasfilecopy::logging::{self, LogConfig};
use nasfilecopy::remote::{RemoteCommand, SshTarget};
use nasfilecopy::{cli, config::AppConfig, context::AppContext};
use serde::Serialize;
use tracing::error;

#[derive(Parser)]
#[command(name = "nasfilecopy", version)]
#[command(about = "Copy NAS datasets onto labelled removable drives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Run against an in-memory host instead of real devices
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    mount_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    lock_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the block device inventory as JSON
    List(ListArgs),
    /// Copy a mounted dataset onto the drive with the given label
    Copy(CopyArgs),
    /// Run list or copy on a remote host over SSH
    Remote(RemoteArgs),
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    label: Option<String>,
}

#[derive(Args)]
struct CopyArgs {
    #[arg(long)]
    source_name: Option<String>,

    #[arg(long)]
    destination_device_label: Option<String>,

    /// Kill a running copy that holds the lock
    #[arg(long)]
    force_kill: bool,
}

impl From<CopyArgs> for CopyRequest {
    fn from(args: CopyArgs) -> Self {
        CopyRequest {
            source_name: args.source_name,
            destination_label: args.destination_device_label,
            force_kill: args.force_kill,
        }
    }
}

#[derive(Args)]
struct RemoteArgs {
    #[arg(long)]
    host: String,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Path of nasfilecopy on the remote host
    #[arg(long)]
    server_binary: Option<String>,

    #[command(subcommand)]
    command: RemoteCommands,
}

#[derive(Subcommand)]
enum RemoteCommands {
    List(ListArgs),
    Copy(CopyArgs),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::Ok.into(),
                _ => ExitCode::ArgumentOrCliIssue.into(),
            };
        }
    };

    let config = match AppConfig::new(Some(&cli.global)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::ArgumentOrCliIssue.into();
        }
    };

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match run(cli.command, config).await {
        Ok(code) => code.into(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Unhandled failure");
            ExitCode::UncaughtException.into()
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<ExitCode> {
    let ctx = AppContext::from_config(config);

    match command {
        Commands::List(args) => cli::run_list(&ctx, args.label.as_deref()).await,
        Commands::Copy(args) => cli::run_copy(ctx, args.into()).await,
        Commands::Remote(args) => {
            let target = SshTarget {
                user: args.user,
                host: args.host,
                port: args.port,
            };
            let command = match args.command {
                RemoteCommands::List(list) => RemoteCommand::List { label: list.label },
                RemoteCommands::Copy(copy) => RemoteCommand::Copy(copy.into()),
            };
            cli::run_remote(&ctx, target, args.server_binary, command).await
        }
    }
}
