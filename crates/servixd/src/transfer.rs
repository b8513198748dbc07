//! Session recovery: a fresh connection claims a previous one's state.
//!
//! ```text
//! client                 server
//!   │  connect              │
//!   │ ────────────────────▶ │  cnx-7 created (Connected)
//!   │  cnx_transfer         │
//!   │  {from: cnx-3,        │  one actor step:
//!   │   to:   cnx-7}        │    copy data + channels cnx-3 ─▶ cnx-7
//!   │ ────────────────────▶ │    cancel cnx-3 timer, delete cnx-3
//!   │  cnx_transfer_ack     │
//!   │ ◀──────────────────── │
//! ```
//!
//! The whole move runs inside the connections actor, so a concurrent expiry
//! or a second transfer citing the same source sees either the old state or
//! nothing at all.

use thiserror::Error;
use tracing::info;

use servix_core::ConnectionId;

use crate::connections::{ConnectionEntry, ConnectionTable};

/// Reasons a transfer is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("cannot transfer {0} onto itself")]
    SameConnection(ConnectionId),

    /// Source expired, was already transferred, or never existed.
    #[error("unknown connection: {0}")]
    UnknownSource(ConnectionId),

    #[error("target connection not found: {0}")]
    UnknownTarget(ConnectionId),

    #[error("target connection is not connected: {0}")]
    TargetNotConnected(ConnectionId),

    /// A transfer may only claim state for the connection that asked.
    #[error("connection {requester} cannot transfer onto {target}")]
    Forbidden {
        requester: ConnectionId,
        target: ConnectionId,
    },

    #[error("connections actor unavailable")]
    ChannelClosed,
}

impl ConnectionTable {
    /// Replaces `to`'s session data and memberships with `from`'s, then
    /// deletes `from`. Returns the removed source entry.
    pub fn transfer(
        &mut self,
        from: &ConnectionId,
        to: &ConnectionId,
    ) -> Result<ConnectionEntry, TransferError> {
        if from == to {
            return Err(TransferError::SameConnection(from.clone()));
        }
        if !self.entries.contains_key(from) {
            return Err(TransferError::UnknownSource(from.clone()));
        }
        match self.entries.get(to) {
            None => return Err(TransferError::UnknownTarget(to.clone())),
            Some(target) if !target.state.is_connected() => {
                return Err(TransferError::TargetNotConnected(to.clone()));
            }
            Some(_) => {}
        }

        let source = self
            .remove(from)
            .ok_or_else(|| TransferError::UnknownSource(from.clone()))?;

        self.reset(to)
            .map_err(|_| TransferError::UnknownTarget(to.clone()))?;
        for channel in &source.channels {
            self.join(channel, to)
                .map_err(|_| TransferError::UnknownTarget(to.clone()))?;
        }
        let target = self
            .get_mut(to)
            .map_err(|_| TransferError::UnknownTarget(to.clone()))?;
        target.data = source.data.clone();

        info!(
            from = %from,
            to = %to,
            keys = source.data.len(),
            channels = source.channels.len(),
            "Connection state transferred"
        );
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_with_session() -> (ConnectionTable, ConnectionId, ConnectionId) {
        let mut table = ConnectionTable::new();
        let old = table.insert("old".into(), None);
        table.join("everyone", &old).unwrap();
        table.join("room-1", &old).unwrap();
        table
            .get_mut(&old)
            .unwrap()
            .data
            .insert("user".into(), json!({"id": 4}));
        table.unbind(&old).unwrap();

        let new = table.insert("new".into(), None);
        table.join("everyone", &new).unwrap();
        table.join("lobby", &new).unwrap();
        (table, old, new)
    }

    #[test]
    fn test_transfer_copies_state_and_deletes_source() {
        let (mut table, old, new) = table_with_session();
        let before = table.snapshot(&old).unwrap();

        table.transfer(&old, &new).unwrap();

        assert!(table.get(&old).is_none());
        let after = table.snapshot(&new).unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.channels, before.channels);
        assert!(table.members("lobby").is_empty());
        assert_eq!(table.members("room-1"), vec![new.clone()]);
        assert_eq!(table.members("everyone"), vec![new]);
    }

    #[test]
    fn test_second_transfer_fails() {
        let (mut table, old, new) = table_with_session();
        table.transfer(&old, &new).unwrap();

        assert_eq!(
            table.transfer(&old, &new).unwrap_err(),
            TransferError::UnknownSource(old)
        );
    }

    #[test]
    fn test_transfer_onto_itself_rejected() {
        let (mut table, _, new) = table_with_session();
        assert_eq!(
            table.transfer(&new, &new).unwrap_err(),
            TransferError::SameConnection(new.clone())
        );
        assert!(table.get(&new).is_some());
    }

    #[test]
    fn test_transfer_requires_connected_target() {
        let (mut table, old, new) = table_with_session();
        table.unbind(&new).unwrap();

        assert_eq!(
            table.transfer(&old, &new).unwrap_err(),
            TransferError::TargetNotConnected(new)
        );
        // nothing moved
        assert!(table.get(&old).is_some());
    }
}
