//! Error types for the servix client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use servix_core::ServiceError;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors surfaced by [`crate::ServixClient`].
///
/// Application errors raised by a service arrive as [`ClientError::Service`]
/// and leave the connection usable. Everything else describes the transport.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket could not be reached. Usually the server is not running.
    #[error("Failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server speaks an incompatible protocol version.
    #[error("Protocol version mismatch (client: {client_version}, server: {server_version})")]
    VersionMismatch {
        client_version: String,
        server_version: String,
    },

    /// The server refused the handshake.
    #[error("Connection rejected: {reason}")]
    Rejected { reason: String },

    /// A message arrived that makes no sense at this point of the exchange.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply within the request timeout. The server may still complete
    /// the call; the outcome is simply no longer reported.
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The transport closed before a reply arrived.
    #[error("Connection to server closed")]
    Disconnected,

    /// The call reached the service and failed there.
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ClientError {
    /// True for transport failures worth a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Disconnected | Self::Io(_)
        )
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_is_not_transport() {
        let err = ClientError::from(ServiceError::missing_service("Ghost"));
        assert!(!err.is_transport());
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_connect_error_names_socket() {
        let err = ClientError::Connect {
            path: PathBuf::from("/tmp/nowhere.sock"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.is_transport());
        assert!(err.to_string().contains("/tmp/nowhere.sock"));
    }
}
