//! Connection identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix used for server-assigned connection identifiers.
pub const CONNECTION_ID_PREFIX: &str = "cnx-";

/// Unique identifier for a client connection.
///
/// Assigned by the server when a transport is accepted (e.g. "cnx-42").
/// Clients keep it so they can claim the connection's state after a
/// reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a ConnectionId from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates the server-assigned identifier for connection number `n`.
    pub fn from_counter(n: u64) -> Self {
        Self(format!("{CONNECTION_ID_PREFIX}{n}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a connection.
///
/// ```text
/// Connected ──disconnect──▶ GracePeriod ──timer──▶ (purged)
///                                │
///                                └──transfer──▶ (state moves to the new id)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A transport is bound and the connection receives pushes.
    Connected,

    /// Transport lost; state retained until the expiration timer fires.
    /// Expiry removes the entry outright, so there is no third state.
    GracePeriod,
}

impl ConnectionState {
    /// Returns true if the connection has a live transport.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::GracePeriod => write!(f, "grace period"),
        }
    }
}
