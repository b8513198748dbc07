//! Per-invocation context threaded through hooks and methods.

use std::fmt;

use serde_json::{Map, Value};

use servix_core::{CallerKind, ConnectionId, ServiceError, ServiceResult, Transport};
use servix_protocol::ServerMessage;

use crate::connections::{ConnectionError, ConnectionsHandle};

impl From<ConnectionError> for ServiceError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotFound(id) => {
                ServiceError::session_expired(format!("connection {id} no longer exists"))
            }
            other => ServiceError::unknown(other),
        }
    }
}

/// The connection a call arrived on, with a handle to reach its state.
#[derive(Clone)]
pub struct ConnectionRef {
    pub id: ConnectionId,
    handle: ConnectionsHandle,
}

impl ConnectionRef {
    pub fn new(id: ConnectionId, handle: ConnectionsHandle) -> Self {
        Self { id, handle }
    }

    pub fn handle(&self) -> &ConnectionsHandle {
        &self.handle
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionRef").field(&self.id).finish()
    }
}

/// Who made a call, over what, and from which connection.
///
/// Methods that need session state receive a clone of this.
#[derive(Debug, Clone)]
pub struct Caller {
    pub kind: CallerKind,
    pub transport: Transport,
    pub connection: Option<ConnectionRef>,
}

impl Caller {
    /// A remote client on a socket connection.
    pub fn socket(connection: ConnectionRef) -> Self {
        Self {
            kind: CallerKind::Client,
            transport: Transport::Socket,
            connection: Some(connection),
        }
    }

    /// A remote client over the request/response adapter; no session.
    pub fn http() -> Self {
        Self {
            kind: CallerKind::Client,
            transport: Transport::Http,
            connection: None,
        }
    }

    /// Trusted server-side code.
    pub fn internal() -> Self {
        Self {
            kind: CallerKind::Server,
            transport: Transport::Internal,
            connection: None,
        }
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection.as_ref().map(|c| &c.id)
    }

    fn require_connection(&self) -> ServiceResult<&ConnectionRef> {
        self.connection
            .as_ref()
            .ok_or_else(|| ServiceError::bad_request("session data requires a socket connection"))
    }

    /// Reads a session value. Calls without a connection see no data.
    pub async fn get_data(&self, key: &str) -> ServiceResult<Option<Value>> {
        match &self.connection {
            Some(cnx) => Ok(cnx.handle.get_data(&cnx.id, key).await?),
            None => Ok(None),
        }
    }

    pub async fn set_data(&self, key: &str, value: Value) -> ServiceResult<()> {
        let cnx = self.require_connection()?;
        cnx.handle.set_data(&cnx.id, key, value).await?;
        Ok(())
    }

    pub async fn remove_data(&self, key: &str) -> ServiceResult<Option<Value>> {
        let cnx = self.require_connection()?;
        Ok(cnx.handle.remove_data(&cnx.id, key).await?)
    }

    /// Clears session data and channel memberships. A connection that is
    /// already gone counts as reset.
    pub async fn reset_connection(&self) -> ServiceResult<()> {
        let Some(cnx) = &self.connection else {
            return Ok(());
        };
        match cnx.handle.reset(&cnx.id).await {
            Ok(()) | Err(ConnectionError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Pushes a `service_event` to this caller only.
    pub async fn notify(&self, name: &str, action: &str, result: Value) -> ServiceResult<()> {
        let Some(cnx) = &self.connection else {
            return Ok(());
        };
        let message = ServerMessage::service_event(name, action, result);
        Ok(cnx.handle.notify(&cnx.id, message).await?)
    }
}

/// Invocation context, fresh per call and passed to hooks by value.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub caller: Caller,
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
    /// Free-form scratch space shared by the hooks of one invocation.
    pub params: Map<String, Value>,
    /// Set once the method returned.
    pub result: Option<Value>,
}

impl CallContext {
    pub fn new(caller: Caller, service: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            caller,
            service: service.to_string(),
            method: method.to_string(),
            args,
            params: Map::new(),
            result: None,
        }
    }

    pub fn caller_kind(&self) -> CallerKind {
        self.caller.kind
    }

    pub fn transport(&self) -> Transport {
        self.caller.transport
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.caller.connection_id()
    }

    pub async fn get_data(&self, key: &str) -> ServiceResult<Option<Value>> {
        self.caller.get_data(key).await
    }

    pub async fn set_data(&self, key: &str, value: Value) -> ServiceResult<()> {
        self.caller.set_data(key, value).await
    }

    pub async fn remove_data(&self, key: &str) -> ServiceResult<Option<Value>> {
        self.caller.remove_data(key).await
    }

    pub async fn reset_connection(&self) -> ServiceResult<()> {
        self.caller.reset_connection().await
    }

    pub async fn notify(&self, name: &str, action: &str, result: Value) -> ServiceResult<()> {
        self.caller.notify(name, action, result).await
    }
}
