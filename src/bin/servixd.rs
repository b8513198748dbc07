//! servix daemon - serves the demo `User`/`Post` application over a Unix socket
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (or $XDG_CONFIG_HOME/servix/servix.toml)
//! servixd start
//!
//! # Explicit config file and socket
//! servixd start --config ./servix.toml --socket /tmp/dev.sock
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use servixd::config::ServerConfig;
use servixd::runtime::Runtime;
use servixd::server::DaemonServer;
use servixd::sync::MemoryStore;

/// servix daemon - service dispatch with pub/sub and session recovery
#[derive(Parser, Debug)]
#[command(name = "servixd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server in the foreground
    Start {
        /// Config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Socket path, overriding config and environment
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start {
        config: None,
        socket: None,
    });

    match command {
        Command::Start { config, socket } => {
            let mut config = ServerConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            if let Some(socket) = socket {
                config.socket_path = socket;
            }
            run_daemon(config)
        }
    }
}

fn init_tracing(config: &ServerConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match &config.log_filter {
            Some(directives) => {
                EnvFilter::try_new(directives).context("Invalid log_filter in config")?
            }
            None => EnvFilter::new("")
                .add_directive("servixd=info".parse()?)
                .add_directive("servix_core=info".parse()?)
                .add_directive("servix_protocol=info".parse()?),
        },
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: ServerConfig) -> Result<()> {
    init_tracing(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "servix daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store = Arc::new(MemoryStore::new());
    let registry = servixd::demo::registry(store.clone()).context("Failed to build services")?;
    info!(services = ?registry.service_names(), "Services registered");

    let runtime = Runtime::new(&config, registry, store);
    let server = DaemonServer::new(&config, runtime, cancel_token);

    info!(
        socket = %config.socket_path.display(),
        grace_period_secs = config.grace_period_secs,
        "Starting server"
    );

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("servix daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
