//! Client interface for the `ConnectionsActor`.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `ChannelClosed` variants; query methods that
//! cannot fail fall back to empty values.

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use servix_core::ConnectionId;
use servix_protocol::ServerMessage;

use super::commands::{ConnectionCommand, ConnectionError, ConnectionEvent};
use super::table::{ConnectionSnapshot, Outbox};
use crate::transfer::TransferError;

/// Cheap-to-clone handle to the connections actor.
#[derive(Clone)]
pub struct ConnectionsHandle {
    sender: mpsc::Sender<ConnectionCommand>,
    event_sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionsHandle {
    pub fn new(
        sender: mpsc::Sender<ConnectionCommand>,
        event_sender: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh oneshot and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Registers a new `Connected` connection and returns its id.
    ///
    /// # Errors
    ///
    /// `ConnectionError::ChannelClosed` if the actor has shut down.
    pub async fn create(
        &self,
        client_address: impl Into<String>,
        outbox: Option<Outbox>,
    ) -> Result<ConnectionId, ConnectionError> {
        let client_address = client_address.into();
        self.request(|respond_to| ConnectionCommand::Create {
            client_address,
            outbox,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)
    }

    /// Snapshot of a connection, `None` if unknown or the actor is gone.
    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let id = id.clone();
        self.request(|respond_to| ConnectionCommand::Get { id, respond_to })
            .await
            .flatten()
    }

    /// Stores a session value and returns the previous one.
    pub async fn set_data(
        &self,
        id: &ConnectionId,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, ConnectionError> {
        let (id, key) = (id.clone(), key.into());
        self.request(|respond_to| ConnectionCommand::SetData {
            id,
            key,
            value,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    pub async fn get_data(
        &self,
        id: &ConnectionId,
        key: impl Into<String>,
    ) -> Result<Option<Value>, ConnectionError> {
        let (id, key) = (id.clone(), key.into());
        self.request(|respond_to| ConnectionCommand::GetData {
            id,
            key,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    pub async fn remove_data(
        &self,
        id: &ConnectionId,
        key: impl Into<String>,
    ) -> Result<Option<Value>, ConnectionError> {
        let (id, key) = (id.clone(), key.into());
        self.request(|respond_to| ConnectionCommand::RemoveData {
            id,
            key,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    /// Clears session data and channel memberships.
    pub async fn reset(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let id = id.clone();
        self.request(|respond_to| ConnectionCommand::Reset { id, respond_to })
            .await
            .ok_or(ConnectionError::ChannelClosed)?
    }

    /// Starts the grace period. Idempotent.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let id = id.clone();
        self.request(|respond_to| ConnectionCommand::Disconnect { id, respond_to })
            .await
            .ok_or(ConnectionError::ChannelClosed)?
    }

    /// Deletes a connection now. Absence counts as success.
    pub async fn remove(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let id = id.clone();
        self.request(|respond_to| ConnectionCommand::Remove { id, respond_to })
            .await
            .map(|_| ())
            .ok_or(ConnectionError::ChannelClosed)
    }

    /// Adds the connection to `channel`; true if newly added.
    pub async fn join(
        &self,
        channel: impl Into<String>,
        id: &ConnectionId,
    ) -> Result<bool, ConnectionError> {
        let (channel, id) = (channel.into(), id.clone());
        self.request(|respond_to| ConnectionCommand::Join {
            channel,
            id,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    /// Removes the connection from `channel`; true if it was a member.
    pub async fn leave(
        &self,
        channel: impl Into<String>,
        id: &ConnectionId,
    ) -> Result<bool, ConnectionError> {
        let (channel, id) = (channel.into(), id.clone());
        self.request(|respond_to| ConnectionCommand::Leave {
            channel,
            id,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    pub async fn members(&self, channel: impl Into<String>) -> Vec<ConnectionId> {
        let channel = channel.into();
        self.request(|respond_to| ConnectionCommand::Members { channel, respond_to })
            .await
            .unwrap_or_default()
    }

    /// Delivers `message` once to each bound member of any listed channel.
    /// Returns the number of deliveries, 0 if the actor is gone.
    pub async fn broadcast(&self, channels: Vec<String>, message: ServerMessage) -> usize {
        self.request(|respond_to| ConnectionCommand::Broadcast {
            channels,
            message,
            respond_to,
        })
        .await
        .unwrap_or(0)
    }

    /// Pushes an unsolicited message to one connection.
    pub async fn notify(
        &self,
        id: &ConnectionId,
        message: ServerMessage,
    ) -> Result<(), ConnectionError> {
        let id = id.clone();
        self.request(|respond_to| ConnectionCommand::Notify {
            id,
            message,
            respond_to,
        })
        .await
        .ok_or(ConnectionError::ChannelClosed)?
    }

    /// Moves `from`'s session data and memberships onto `to` and deletes
    /// `from`, as one atomic step.
    ///
    /// # Errors
    ///
    /// See [`TransferError`]; on error nothing changed.
    pub async fn transfer(
        &self,
        from: &ConnectionId,
        to: &ConnectionId,
    ) -> Result<(), TransferError> {
        let (from, to) = (from.clone(), to.clone());
        self.request(|respond_to| ConnectionCommand::Transfer {
            from,
            to,
            respond_to,
        })
        .await
        .ok_or(TransferError::ChannelClosed)?
    }

    pub async fn count(&self) -> usize {
        self.request(|respond_to| ConnectionCommand::Count { respond_to })
            .await
            .unwrap_or(0)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns true while the actor is running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
