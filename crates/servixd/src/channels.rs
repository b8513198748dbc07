//! Channel-based publish/subscribe.
//!
//! Membership lives in the connection table (so transfer and expiry move or
//! drop it together with the session). This hub is the publishing front.

use serde_json::Value;
use tracing::debug;

use servix_core::ConnectionId;
use servix_protocol::ServerMessage;

use crate::connections::{ConnectionError, ConnectionsHandle};

#[derive(Clone)]
pub struct ChannelHub {
    connections: ConnectionsHandle,
}

impl ChannelHub {
    pub fn new(connections: ConnectionsHandle) -> Self {
        Self { connections }
    }

    /// Idempotent. Returns true if the connection was not yet a member.
    pub async fn join(
        &self,
        channel: &str,
        id: &ConnectionId,
    ) -> Result<bool, ConnectionError> {
        self.connections.join(channel, id).await
    }

    /// No-op for non-members. Returns true if the connection was a member.
    pub async fn leave(
        &self,
        channel: &str,
        id: &ConnectionId,
    ) -> Result<bool, ConnectionError> {
        self.connections.leave(channel, id).await
    }

    pub async fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.connections.members(channel).await
    }

    /// Sends `service_event { name, action, result }` once to every bound
    /// connection in any of `channels`. Returns the delivery count.
    pub async fn publish(
        &self,
        channels: Vec<String>,
        service: &str,
        action: &str,
        result: Value,
    ) -> usize {
        if channels.is_empty() {
            return 0;
        }
        let message = ServerMessage::service_event(service, action, result);
        let delivered = self.broadcast(channels.clone(), message).await;
        debug!(service, action, channels = ?channels, delivered, "Service event published");
        delivered
    }

    /// Delivers an arbitrary message to the members of `channels`.
    pub async fn broadcast(&self, mut channels: Vec<String>, message: ServerMessage) -> usize {
        channels.sort();
        channels.dedup();
        self.connections.broadcast(channels, message).await
    }
}
