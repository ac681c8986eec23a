use crate::config::{Config, load_config};
use crate::state::ControllerContext;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod aggregator;
mod commands;
mod config;
mod controller;
mod images;
mod prefetch;
mod queue;
mod reconciler;
mod state;
mod watcher;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch workloads and keep the prefetch DaemonSet in sync (default)
    Operator {
        #[arg(long, env = "CONFIG_PATH", value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
    /// Copy this binary to a destination and make it executable
    Copy {
        #[arg(long, default_value = prefetch::SHARED_BINARY_PATH)]
        dest: PathBuf,
    },
    /// Wait until a termination signal is received
    Sleep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Operator { config: None }) {
        Command::Operator { config } => run_operator(config).await,
        Command::Copy { dest } => commands::copy_self(&dest).await,
        Command::Sleep => commands::wait_for_termination().await,
    }
}

async fn run_operator(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting kube-image-prefetch {}", env!("CARGO_PKG_VERSION"));

    let config = match config_path {
        Some(path) => load_config(path)?,
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    let client = controller::create_client().await?;
    let ctx = ControllerContext {
        kube_client: client,
        config,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = commands::wait_for_termination().await {
                tracing::error!("Error waiting for termination signal: {:?}", e);
            }
            shutdown.cancel();
        }
    });

    controller::run(ctx, shutdown).await
}
