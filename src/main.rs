//! devlink - Android device connection lifecycle manager
//!
//! Tracks devices attached through adb, waits for them to become ready,
//! and runs shell, transfer and launch requests against them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use devlink::commands::{
    DevicesCommand, LaunchCommand, Session, ShellCommand, TransferCommand, WatchCommand,
};
use devlink::core::{AppConfig, APP_NAME, VERSION};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "devlink")]
#[command(about = "Track Android devices and wait for them to become ready")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the per-user config)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known devices and their connection state
    Devices,
    /// Print lifecycle events until interrupted
    Watch,
    /// Run a shell command on a device
    Shell {
        serial: String,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy a local file to a device
    Push {
        serial: String,
        local: PathBuf,
        remote: String,
    },
    /// Copy a file from a device
    Pull {
        serial: String,
        remote: String,
        local: PathBuf,
    },
    /// Start an emulator and wait until it is ready
    Launch {
        avd: String,
        /// Application the device is started for
        #[arg(long, default_value = APP_NAME)]
        app: String,
        /// Run without a window or audio
        #[arg(long)]
        headless: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("{} v{} starting...", APP_NAME, VERSION);

    let config = match &args.config {
        Some(path) => AppConfig::load_from(path).await?,
        None => AppConfig::load().await?,
    };

    let session = Session::connect(config).await?;
    let result = run(&args, &session).await;
    session.close().await;
    result
}

async fn run(args: &Args, session: &Session) -> Result<()> {
    match &args.command {
        Command::Devices => DevicesCommand { json: args.json }.execute(session).await,
        Command::Watch => WatchCommand { json: args.json }.execute(session).await,
        Command::Shell {
            serial,
            timeout_ms,
            command,
        } => {
            ShellCommand {
                serial: serial.clone(),
                command: command.clone(),
                timeout: timeout_ms.map(Duration::from_millis),
            }
            .execute(session)
            .await
        }
        Command::Push {
            serial,
            local,
            remote,
        } => {
            TransferCommand {
                serial: serial.clone(),
                push: true,
                local: local.clone(),
                remote: remote.clone(),
            }
            .execute(session)
            .await
        }
        Command::Pull {
            serial,
            remote,
            local,
        } => {
            TransferCommand {
                serial: serial.clone(),
                push: false,
                local: local.clone(),
                remote: remote.clone(),
            }
            .execute(session)
            .await
        }
        Command::Launch { avd, app, headless } => {
            LaunchCommand {
                avd: avd.clone(),
                app: app.clone(),
                headless: *headless,
            }
            .execute(session)
            .await
        }
    }
}
