//! Protocol message types for the socket transport.

use crate::sync::{SyncRequest, SyncResponse};
use crate::version::ProtocolVersion;
use servix_core::{ConnectionId, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types that can be sent by clients to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first message on a new transport.
    Connect {
        /// Free-form client label, logged only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Invoke `action` on service `name`.
    ClientRequest {
        /// Correlation id chosen by the client
        uid: String,
        /// Service name
        name: String,
        /// Method name
        action: String,
        /// Positional arguments
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Claim the state of a previous connection after a reconnect.
    CnxTransfer {
        /// Connection whose state is claimed
        from_id: ConnectionId,
        /// The claiming (current) connection
        to_id: ConnectionId,
    },

    /// Reconcile offline client state.
    SyncRequest(SyncRequest),

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn request(
        uid: impl Into<String>,
        name: impl Into<String>,
        action: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(MessageType::ClientRequest {
            uid: uid.into(),
            name: name.into(),
            action: action.into(),
            args,
        })
    }

    pub fn transfer(from_id: ConnectionId, to_id: ConnectionId) -> Self {
        Self::new(MessageType::CnxTransfer { from_id, to_id })
    }

    pub fn sync(request: SyncRequest) -> Self {
        Self::new(MessageType::SyncRequest(request))
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Reply to a `client_request`: exactly one of `result` / `error`.
///
/// A successful call whose result is `null` carries neither field on the
/// way back in; [`ClientResponse::into_result`] maps that to `Ok(Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl ClientResponse {
    pub fn from_result(uid: impl Into<String>, result: Result<Value, ServiceError>) -> Self {
        let uid = uid.into();
        match result {
            Ok(value) => Self {
                uid,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                uid,
                result: None,
                error: Some(err),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, ServiceError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Messages sent from server to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        /// Server's protocol version
        protocol_version: ProtocolVersion,
        /// Identity assigned to this transport
        connection_id: ConnectionId,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Server's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Reply to a `client_request`
    ClientResponse(ClientResponse),

    /// Pub/sub push after a successful call
    ServiceEvent {
        /// Service name
        name: String,
        /// Method that produced the result
        action: String,
        /// Method result
        result: Value,
    },

    /// Transfer succeeded; the state now lives under `to_id`
    CnxTransferAck { to_id: ConnectionId },

    /// Transfer failed; the client must start a fresh session
    CnxTransferError {
        from_id: ConnectionId,
        reason: String,
    },

    /// Reply to a `sync_request`
    SyncResponse(SyncResponse),

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Protocol-level error (malformed message, bad handshake)
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn connected(connection_id: ConnectionId) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            connection_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn response(uid: impl Into<String>, result: Result<Value, ServiceError>) -> Self {
        Self::ClientResponse(ClientResponse::from_result(uid, result))
    }

    pub fn service_event(name: impl Into<String>, action: impl Into<String>, result: Value) -> Self {
        Self::ServiceEvent {
            name: name.into(),
            action: action.into(),
            result,
        }
    }

    pub fn transfer_ack(to_id: ConnectionId) -> Self {
        Self::CnxTransferAck { to_id }
    }

    pub fn transfer_error(from_id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::CnxTransferError {
            from_id,
            reason: reason.into(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
