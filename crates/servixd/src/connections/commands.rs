//! Connections actor commands, errors, and events.
//!
//! - `ConnectionCommand`: requests sent to the `ConnectionsActor`
//! - `ConnectionError`: failures of connection operations
//! - `ConnectionEvent`: lifecycle notifications for subscribers

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use servix_core::ConnectionId;
use servix_protocol::ServerMessage;

use super::table::{ConnectionSnapshot, Outbox};
use crate::transfer::TransferError;

// ============================================================================
// Commands
// ============================================================================

/// Commands processed by the connections actor, one at a time.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Track a new `Connected` connection.
    Create {
        client_address: String,
        /// Mailbox of the bound transport, `None` for transport-less callers
        outbox: Option<Outbox>,
        respond_to: oneshot::Sender<ConnectionId>,
    },

    Get {
        id: ConnectionId,
        respond_to: oneshot::Sender<Option<ConnectionSnapshot>>,
    },

    /// Store a session value, returning the previous one.
    SetData {
        id: ConnectionId,
        key: String,
        value: Value,
        respond_to: oneshot::Sender<Result<Option<Value>, ConnectionError>>,
    },

    GetData {
        id: ConnectionId,
        key: String,
        respond_to: oneshot::Sender<Result<Option<Value>, ConnectionError>>,
    },

    RemoveData {
        id: ConnectionId,
        key: String,
        respond_to: oneshot::Sender<Result<Option<Value>, ConnectionError>>,
    },

    /// Clear session data and channel memberships.
    Reset {
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), ConnectionError>>,
    },

    /// Transport lost: enter the grace period and arm the expiration timer.
    Disconnect {
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), ConnectionError>>,
    },

    /// Delete immediately. Replies whether anything was removed.
    Remove {
        id: ConnectionId,
        respond_to: oneshot::Sender<bool>,
    },

    Join {
        channel: String,
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<bool, ConnectionError>>,
    },

    Leave {
        channel: String,
        id: ConnectionId,
        respond_to: oneshot::Sender<Result<bool, ConnectionError>>,
    },

    Members {
        channel: String,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },

    /// Fan a message out to every bound member of the listed channels.
    Broadcast {
        channels: Vec<String>,
        message: ServerMessage,
        respond_to: oneshot::Sender<usize>,
    },

    /// Push a message to one bound connection.
    Notify {
        id: ConnectionId,
        message: ServerMessage,
        respond_to: oneshot::Sender<Result<(), ConnectionError>>,
    },

    /// Move state from `from` to `to` and delete `from`.
    Transfer {
        from: ConnectionId,
        to: ConnectionId,
        respond_to: oneshot::Sender<Result<(), TransferError>>,
    },

    Count {
        respond_to: oneshot::Sender<usize>,
    },

    /// Fired by an expiration timer. Ignored unless `generation` still
    /// matches the connection's armed timer.
    Expire { id: ConnectionId, generation: u64 },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    /// The connection is in its grace period and has no transport.
    #[error("connection has no bound transport: {0}")]
    NotConnected(ConnectionId),

    #[error("mailbox closed or full for connection {0}")]
    MailboxClosed(ConnectionId),

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle notifications published by the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Created { id: ConnectionId },
    Disconnected { id: ConnectionId },
    /// Grace period elapsed; state purged.
    Expired { id: ConnectionId },
    Transferred { from: ConnectionId, to: ConnectionId },
    Removed { id: ConnectionId },
}
