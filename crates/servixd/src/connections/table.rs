//! In-memory connection table with a channel membership index.
//!
//! Pure data structure: no tasks, no timers. The `ConnectionsActor` owns the
//! only instance, so every mutation here is already serialized.
//!
//! Membership is stored twice and kept in lockstep:
//!
//! ```text
//! entries:  cnx-1 ─▶ { channels: {everyone, admins} }
//!           cnx-2 ─▶ { channels: {everyone} }
//!
//! members:  everyone ─▶ {cnx-1, cnx-2}
//!           admins   ─▶ {cnx-1}
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use servix_core::{ConnectionId, ConnectionState};
use servix_protocol::ServerMessage;

use super::commands::ConnectionError;

/// Sending side of a connection's outbound mailbox.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// One tracked connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub client_address: String,
    pub data: HashMap<String, Value>,
    pub channels: HashSet<String>,
    pub state: ConnectionState,
    /// Present only while a transport is bound.
    pub outbox: Option<Outbox>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionEntry {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            client_address: self.client_address.clone(),
            data: self.data.clone(),
            channels: self.channels.iter().cloned().collect(),
            state: self.state,
            connected_at: self.connected_at,
        }
    }

    /// Pushes a message without waiting. Returns false if nothing was queued.
    fn try_deliver(&self, message: ServerMessage) -> bool {
        let Some(outbox) = &self.outbox else {
            return false;
        };
        match outbox.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "Outbox full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "Outbox closed, skipping message");
                false
            }
        }
    }
}

/// Read-only copy of a connection handed out by the actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub client_address: String,
    pub data: HashMap<String, Value>,
    pub channels: BTreeSet<String>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// All connections plus the reverse `channel → members` index.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: u64,
    pub(crate) entries: HashMap<ConnectionId, ConnectionEntry>,
    pub(crate) members: HashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocates the next `cnx-<n>` id and inserts a `Connected` entry.
    pub fn insert(&mut self, client_address: String, outbox: Option<Outbox>) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId::from_counter(self.next_id);
        self.entries.insert(
            id.clone(),
            ConnectionEntry {
                id: id.clone(),
                client_address,
                data: HashMap::new(),
                channels: HashSet::new(),
                state: ConnectionState::Connected,
                outbox,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Result<&mut ConnectionEntry, ConnectionError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| ConnectionError::NotFound(id.clone()))
    }

    pub fn snapshot(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        self.entries.get(id).map(ConnectionEntry::snapshot)
    }

    /// Removes the entry and every membership it held.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.entries.remove(id)?;
        for channel in &entry.channels {
            self.unindex(channel, id);
        }
        Some(entry)
    }

    /// Marks a connection as having lost its transport.
    pub fn unbind(&mut self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let entry = self.get_mut(id)?;
        entry.state = ConnectionState::GracePeriod;
        entry.outbox = None;
        Ok(())
    }

    /// Clears session data and channel memberships.
    pub fn reset(&mut self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let entry = self.get_mut(id)?;
        entry.data.clear();
        let channels: Vec<String> = entry.channels.drain().collect();
        for channel in &channels {
            self.unindex(channel, id);
        }
        Ok(())
    }

    // ========================================================================
    // Channel membership
    // ========================================================================

    /// Adds `id` to `channel`. Returns true if it was not already a member.
    pub fn join(&mut self, channel: &str, id: &ConnectionId) -> Result<bool, ConnectionError> {
        let entry = self.get_mut(id)?;
        let added = entry.channels.insert(channel.to_string());
        if added {
            self.members
                .entry(channel.to_string())
                .or_default()
                .insert(id.clone());
        }
        Ok(added)
    }

    /// Removes `id` from `channel`. Returns true if it was a member.
    pub fn leave(&mut self, channel: &str, id: &ConnectionId) -> Result<bool, ConnectionError> {
        let entry = self.get_mut(id)?;
        let removed = entry.channels.remove(channel);
        if removed {
            self.unindex(channel, id);
        }
        Ok(removed)
    }

    /// Current members of `channel`, sorted.
    pub fn members(&self, channel: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .members
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Union of the members of every listed channel, each id once.
    pub fn recipients(&self, channels: &[String]) -> HashSet<ConnectionId> {
        channels
            .iter()
            .filter_map(|channel| self.members.get(channel))
            .flat_map(|set| set.iter().cloned())
            .collect()
    }

    /// Delivers `message` once to every bound member of any listed channel.
    ///
    /// Returns the number of mailboxes the message was queued on.
    pub fn deliver(&self, channels: &[String], message: &ServerMessage) -> usize {
        self.recipients(channels)
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|entry| entry.state.is_connected())
            .filter(|entry| entry.try_deliver(message.clone()))
            .count()
    }

    /// Pushes a message to a single bound connection.
    pub fn notify(&self, id: &ConnectionId, message: ServerMessage) -> Result<(), ConnectionError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| ConnectionError::NotFound(id.clone()))?;
        if entry.outbox.is_none() {
            return Err(ConnectionError::NotConnected(id.clone()));
        }
        if entry.try_deliver(message) {
            Ok(())
        } else {
            Err(ConnectionError::MailboxClosed(id.clone()))
        }
    }

    fn unindex(&mut self, channel: &str, id: &ConnectionId) {
        if let Some(set) = self.members.get_mut(channel) {
            set.remove(id);
            if set.is_empty() {
                self.members.remove(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_table(n: usize) -> (ConnectionTable, Vec<(ConnectionId, mpsc::Receiver<ServerMessage>)>) {
        let mut table = ConnectionTable::new();
        let conns = (0..n)
            .map(|i| {
                let (tx, rx) = mpsc::channel(8);
                (table.insert(format!("test-{i}"), Some(tx)), rx)
            })
            .collect();
        (table, conns)
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut table = ConnectionTable::new();
        assert_eq!(table.insert("a".into(), None).as_str(), "cnx-1");
        assert_eq!(table.insert("b".into(), None).as_str(), "cnx-2");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut table = ConnectionTable::new();
        let id = table.insert("a".into(), None);

        assert!(table.join("everyone", &id).unwrap());
        assert!(!table.join("everyone", &id).unwrap());
        assert_eq!(table.members("everyone"), vec![id.clone()]);
        assert_eq!(table.get(&id).unwrap().channels.len(), 1);
    }

    #[test]
    fn test_leave_non_member_is_noop() {
        let mut table = ConnectionTable::new();
        let id = table.insert("a".into(), None);

        assert!(!table.leave("nowhere", &id).unwrap());
        assert!(table.members.is_empty());
    }

    #[test]
    fn test_join_unknown_connection_fails() {
        let mut table = ConnectionTable::new();
        let result = table.join("everyone", &ConnectionId::new("cnx-99"));
        assert!(matches!(result, Err(ConnectionError::NotFound(_))));
    }

    #[test]
    fn test_disjoint_channels_order_independent() {
        let mut a = ConnectionTable::new();
        let id_a = a.insert("a".into(), None);
        a.join("x", &id_a).unwrap();
        a.join("y", &id_a).unwrap();
        a.leave("x", &id_a).unwrap();

        let mut b = ConnectionTable::new();
        let id_b = b.insert("a".into(), None);
        b.join("y", &id_b).unwrap();
        b.join("x", &id_b).unwrap();
        b.leave("x", &id_b).unwrap();

        assert_eq!(a.snapshot(&id_a).unwrap().channels, b.snapshot(&id_b).unwrap().channels);
        assert_eq!(a.members("y"), b.members("y"));
    }

    #[test]
    fn test_deliver_deduplicates_across_channels() {
        let (mut table, mut conns) = bound_table(2);
        let first = conns[0].0.clone();
        let second = conns[1].0.clone();

        table.join("everyone", &first).unwrap();
        table.join("admins", &first).unwrap();
        table.join("admins", &second).unwrap();

        let message = ServerMessage::service_event("User", "create", serde_json::json!({"id": 1}));
        let delivered = table.deliver(&["everyone".to_string(), "admins".to_string()], &message);
        assert_eq!(delivered, 2);

        assert!(conns[0].1.try_recv().is_ok());
        assert!(conns[0].1.try_recv().is_err());
        assert!(conns[1].1.try_recv().is_ok());
    }

    #[test]
    fn test_deliver_skips_grace_period() {
        let (mut table, mut conns) = bound_table(1);
        let id = conns[0].0.clone();
        table.join("everyone", &id).unwrap();
        table.unbind(&id).unwrap();

        let message = ServerMessage::pong(1);
        assert_eq!(table.deliver(&["everyone".to_string()], &message), 0);
        assert!(conns[0].1.try_recv().is_err());
        // membership survives the disconnect
        assert_eq!(table.members("everyone"), vec![id]);
    }

    #[test]
    fn test_reset_clears_data_and_memberships() {
        let mut table = ConnectionTable::new();
        let id = table.insert("a".into(), None);
        table.join("everyone", &id).unwrap();
        table
            .get_mut(&id)
            .unwrap()
            .data
            .insert("user".into(), serde_json::json!(1));

        table.reset(&id).unwrap();

        let snapshot = table.snapshot(&id).unwrap();
        assert!(snapshot.data.is_empty());
        assert!(snapshot.channels.is_empty());
        assert!(table.members("everyone").is_empty());
    }

    #[test]
    fn test_remove_drops_index_entries() {
        let mut table = ConnectionTable::new();
        let id = table.insert("a".into(), None);
        table.join("everyone", &id).unwrap();

        assert!(table.remove(&id).is_some());
        assert!(table.remove(&id).is_none());
        assert!(table.members.is_empty());
    }

    #[test]
    fn test_notify_requires_bound_transport() {
        let (mut table, mut conns) = bound_table(1);
        let id = conns[0].0.clone();

        table.notify(&id, ServerMessage::pong(7)).unwrap();
        assert!(matches!(conns[0].1.try_recv(), Ok(ServerMessage::Pong { seq: 7 })));

        table.unbind(&id).unwrap();
        assert!(matches!(
            table.notify(&id, ServerMessage::pong(8)),
            Err(ConnectionError::NotConnected(_))
        ));
    }
}
