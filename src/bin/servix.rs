//! servix - command-line client for a servix server
//!
//! # Usage
//!
//! ```bash
//! servix call User create '{"username": "ada", "password": "pw"}'
//! servix call User find '{"username": "ada"}'
//! servix watch
//! servix ping
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use servix_client::{ClientConfig, ClientError, Recovery, ServixClient};

/// How often `watch` checks whether the server went away.
const WATCH_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// servix client
#[derive(Parser, Debug)]
#[command(name = "servix", version, about)]
struct Args {
    /// Server socket (defaults to $SERVIX_SOCKET or /tmp/servix.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Seconds to wait for each reply
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Invoke a service method and print its result
    Call {
        service: String,
        action: String,
        /// Positional arguments; each is parsed as JSON, falling back to a
        /// plain string
        args: Vec<String>,
    },
    /// Print service events as they arrive
    Watch,
    /// Check that the server answers
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    config.request_timeout = Duration::from_secs(args.timeout);
    config.client_id = Some(format!("servix-cli/{}", env!("CARGO_PKG_VERSION")));

    match args.command {
        Command::Call {
            service,
            action,
            args,
        } => call(config, &service, &action, &args).await,
        Command::Watch => watch(config).await,
        Command::Ping => ping(config).await,
    }
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn connect(config: ClientConfig) -> Result<ServixClient> {
    let socket = config.socket_path.clone();
    ServixClient::connect(config)
        .await
        .with_context(|| format!("Is servixd running on {}?", socket.display()))
}

async fn call(config: ClientConfig, service: &str, action: &str, raw_args: &[String]) -> Result<()> {
    let client = connect(config).await?;
    let args = raw_args.iter().map(|raw| parse_arg(raw)).collect();

    match client.call(service, action, args).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            client.disconnect().await?;
            Ok(())
        }
        Err(ClientError::Service(err)) => {
            eprintln!("{}", serde_json::to_string_pretty(&err)?);
            bail!("{service}.{action} failed with {}", err.code)
        }
        Err(e) => Err(e).context("Call failed"),
    }
}

async fn watch(config: ClientConfig) -> Result<()> {
    let mut client = connect(config).await?;
    let mut events = client.subscribe();
    let mut health = tokio::time::interval(WATCH_HEALTH_INTERVAL);
    eprintln!("Watching service events on {} (Ctrl+C to stop)", client.connection_id());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let line = json!({
                        "name": event.name,
                        "action": event.action,
                        "result": event.result,
                    });
                    println!("{line}");
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped service events"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = health.tick() => {
                if client.is_closed() {
                    match client.reconnect().await.context("Lost the server")? {
                        Recovery::Restored { previous } => {
                            eprintln!("Reconnected, session {previous} restored");
                        }
                        Recovery::Fresh { reason, .. } => {
                            eprintln!("Reconnected with a fresh session ({reason})");
                        }
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                client.disconnect().await?;
                return Ok(());
            }
        }
    }
}

async fn ping(config: ClientConfig) -> Result<()> {
    let client = connect(config).await?;
    let rtt = client.ping().await.context("Ping failed")?;
    println!("pong from {} in {rtt:?}", client.connection_id());
    client.disconnect().await?;
    Ok(())
}
