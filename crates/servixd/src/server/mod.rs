//! Unix socket server for the servix daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Stops accepting and closes handlers on the CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  invoke   ┌─────────────────┐
//! │ConnectionHandler│──────────▶│   Dispatcher    │
//! │   (per client)  │           └────────┬────────┘
//! └───────┬─────────┘                    │ publish
//!         │ create/disconnect/transfer   ▼
//!         │                     ┌─────────────────┐
//!         └────────────────────▶│ConnectionsActor │──▶ outboxes
//!                               └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionHandler, HandlerError, HandlerSettings, OUTBOX_CAPACITY};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::runtime::Runtime;

pub use crate::config::DEFAULT_SOCKET_PATH;

/// Unix socket server for the servix daemon.
pub struct DaemonServer {
    socket_path: PathBuf,
    runtime: Runtime,
    settings: HandlerSettings,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for fallback client labels
    connection_counter: AtomicU64,
}

impl DaemonServer {
    /// Creates a server bound to `config.socket_path` once run.
    pub fn new(config: &ServerConfig, runtime: Runtime, cancel_token: CancellationToken) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            runtime,
            settings: HandlerSettings::from(config),
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Listens for connections until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| self.setup_error(e))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| self.setup_error(e))?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| self.setup_error(e))?;

        info!(
            socket = %self.socket_path.display(),
            services = ?self.runtime.registry().service_names(),
            "Daemon server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.runtime.clone(),
            self.settings.clone(),
            self.cancel_token.child_token(),
            connection_number,
        );

        tokio::spawn(async move {
            if let Some(id) = handler.run().await {
                debug!(connection_id = %id, "Handler finished");
            }
        });
    }

    fn setup_error(&self, e: std::io::Error) -> ServerError {
        ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        }
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Handler(#[from] HandlerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_socket_path() {
        assert_eq!(DEFAULT_SOCKET_PATH, "/tmp/servix.sock");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/nonexistent/servix.sock"),
            error: "permission denied".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/nonexistent/servix.sock"));
        assert!(text.contains("permission denied"));
    }
}
