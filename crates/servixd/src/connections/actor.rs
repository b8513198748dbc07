//! Connections actor - owns the connection table and expiration timers.
//!
//! Timer scheduling, cancellation, expiry, and transfer are all handled as
//! commands on this one task, so none of them can interleave.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored (the caller stopped waiting)
//! - Timer tasks exit quietly once the actor is gone

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use servix_core::ConnectionId;

use super::commands::{ConnectionCommand, ConnectionError, ConnectionEvent};
use super::table::ConnectionTable;

/// An armed expiration timer.
struct ExpiryTimer {
    generation: u64,
    task: JoinHandle<()>,
}

/// The connections actor.
///
/// Processes [`ConnectionCommand`]s sequentially and publishes
/// [`ConnectionEvent`]s.
pub struct ConnectionsActor {
    receiver: mpsc::Receiver<ConnectionCommand>,

    /// Used by timer tasks to post `Expire`; weak so the actor still stops
    /// when every handle is dropped.
    timer_sender: mpsc::WeakSender<ConnectionCommand>,

    table: ConnectionTable,

    timers: HashMap<ConnectionId, ExpiryTimer>,

    next_generation: u64,

    grace_period: Duration,

    event_publisher: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionsActor {
    pub fn new(
        receiver: mpsc::Receiver<ConnectionCommand>,
        timer_sender: mpsc::WeakSender<ConnectionCommand>,
        event_publisher: broadcast::Sender<ConnectionEvent>,
        grace_period: Duration,
    ) -> Self {
        Self {
            receiver,
            timer_sender,
            table: ConnectionTable::new(),
            timers: HashMap::new(),
            next_generation: 0,
            grace_period,
            event_publisher,
        }
    }

    /// Runs until every command sender is dropped.
    pub async fn run(mut self) {
        info!(grace_period_secs = self.grace_period.as_secs(), "Connections actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
        info!(connections = self.table.len(), "Connections actor stopped");
    }

    fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Create {
                client_address,
                outbox,
                respond_to,
            } => {
                let id = self.table.insert(client_address.clone(), outbox);
                info!(connection_id = %id, client = %client_address, total = self.table.len(), "Connection created");
                let _ = self.event_publisher.send(ConnectionEvent::Created { id: id.clone() });
                let _ = respond_to.send(id);
            }
            ConnectionCommand::Get { id, respond_to } => {
                let _ = respond_to.send(self.table.snapshot(&id));
            }
            ConnectionCommand::SetData {
                id,
                key,
                value,
                respond_to,
            } => {
                let result = self
                    .table
                    .get_mut(&id)
                    .map(|entry| entry.data.insert(key, value));
                let _ = respond_to.send(result);
            }
            ConnectionCommand::GetData { id, key, respond_to } => {
                let result = self
                    .table
                    .get(&id)
                    .map(|entry| entry.data.get(&key).cloned())
                    .ok_or(ConnectionError::NotFound(id));
                let _ = respond_to.send(result);
            }
            ConnectionCommand::RemoveData { id, key, respond_to } => {
                let result = self
                    .table
                    .get_mut(&id)
                    .map(|entry| entry.data.remove(&key));
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Reset { id, respond_to } => {
                let result = self.table.reset(&id);
                if result.is_ok() {
                    debug!(connection_id = %id, "Connection reset");
                }
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Disconnect { id, respond_to } => {
                self.handle_disconnect(&id);
                let _ = respond_to.send(Ok(()));
            }
            ConnectionCommand::Remove { id, respond_to } => {
                let _ = respond_to.send(self.handle_remove(&id));
            }
            ConnectionCommand::Join {
                channel,
                id,
                respond_to,
            } => {
                let result = self.table.join(&channel, &id);
                if let Ok(true) = result {
                    debug!(connection_id = %id, channel = %channel, "Joined channel");
                }
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Leave {
                channel,
                id,
                respond_to,
            } => {
                let result = self.table.leave(&channel, &id);
                if let Ok(true) = result {
                    debug!(connection_id = %id, channel = %channel, "Left channel");
                }
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Members { channel, respond_to } => {
                let _ = respond_to.send(self.table.members(&channel));
            }
            ConnectionCommand::Broadcast {
                channels,
                message,
                respond_to,
            } => {
                let delivered = self.table.deliver(&channels, &message);
                debug!(channels = ?channels, delivered, "Broadcast delivered");
                let _ = respond_to.send(delivered);
            }
            ConnectionCommand::Notify {
                id,
                message,
                respond_to,
            } => {
                let _ = respond_to.send(self.table.notify(&id, message));
            }
            ConnectionCommand::Transfer { from, to, respond_to } => {
                let result = self.table.transfer(&from, &to).map(|_| {
                    self.cancel_timer(&from);
                    let _ = self.event_publisher.send(ConnectionEvent::Transferred {
                        from: from.clone(),
                        to: to.clone(),
                    });
                });
                if let Err(err) = &result {
                    warn!(from = %from, to = %to, error = %err, "Connection transfer refused");
                }
                let _ = respond_to.send(result);
            }
            ConnectionCommand::Count { respond_to } => {
                let _ = respond_to.send(self.table.len());
            }
            ConnectionCommand::Expire { id, generation } => {
                self.handle_expire(id, generation);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Moves a connection into its grace period and arms exactly one timer.
    ///
    /// Unknown ids and repeated disconnects are no-ops.
    fn handle_disconnect(&mut self, id: &ConnectionId) {
        let already_waiting = match self.table.get(id) {
            None => {
                debug!(connection_id = %id, "Disconnect for unknown connection ignored");
                return;
            }
            Some(entry) => !entry.state.is_connected(),
        };
        if already_waiting {
            return;
        }
        if self.table.unbind(id).is_err() {
            return;
        }
        self.arm_timer(id.clone());
        info!(
            connection_id = %id,
            grace_period_secs = self.grace_period.as_secs(),
            "Connection entered grace period"
        );
        let _ = self
            .event_publisher
            .send(ConnectionEvent::Disconnected { id: id.clone() });
    }

    fn handle_remove(&mut self, id: &ConnectionId) -> bool {
        self.cancel_timer(id);
        let removed = self.table.remove(id).is_some();
        if removed {
            info!(connection_id = %id, total = self.table.len(), "Connection removed");
            let _ = self
                .event_publisher
                .send(ConnectionEvent::Removed { id: id.clone() });
        }
        removed
    }

    fn handle_expire(&mut self, id: ConnectionId, generation: u64) {
        let current = self.timers.get(&id).map(|timer| timer.generation);
        if current != Some(generation) {
            debug!(connection_id = %id, generation, "Stale expiration timer ignored");
            return;
        }
        self.timers.remove(&id);

        if self.table.remove(&id).is_some() {
            info!(connection_id = %id, total = self.table.len(), "Connection expired");
            let _ = self.event_publisher.send(ConnectionEvent::Expired { id });
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn arm_timer(&mut self, id: ConnectionId) {
        self.cancel_timer(&id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let sender = self.timer_sender.clone();
        let grace_period = self.grace_period;
        let timer_id = id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(ConnectionCommand::Expire {
                        id: timer_id,
                        generation,
                    })
                    .await;
            }
        });
        self.timers.insert(id, ExpiryTimer { generation, task });
    }

    fn cancel_timer(&mut self, id: &ConnectionId) {
        if let Some(timer) = self.timers.remove(id) {
            timer.task.abort();
        }
    }

    /// Returns the number of tracked connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use servix_core::ConnectionState;
    use servix_protocol::ServerMessage;
    use tokio::sync::oneshot;

    fn create_actor() -> (
        mpsc::Sender<ConnectionCommand>,
        ConnectionsActor,
        broadcast::Receiver<ConnectionEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let actor = ConnectionsActor::new(
            cmd_rx,
            cmd_tx.downgrade(),
            event_tx,
            Duration::from_secs(60),
        );
        (cmd_tx, actor, event_rx)
    }

    fn create(actor: &mut ConnectionsActor) -> ConnectionId {
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Create {
            client_address: "test".into(),
            outbox: None,
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn disconnect(actor: &mut ConnectionsActor, id: &ConnectionId) {
        let (tx, _) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Disconnect {
            id: id.clone(),
            respond_to: tx,
        });
    }

    #[tokio::test]
    async fn test_create_publishes_event() {
        let (_tx, mut actor, mut events) = create_actor();

        let id = create(&mut actor);

        assert_eq!(actor.connection_count(), 1);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Created { id });
    }

    #[tokio::test]
    async fn test_session_data_roundtrip() {
        let (_tx, mut actor, _) = create_actor();
        let id = create(&mut actor);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::SetData {
            id: id.clone(),
            key: "user".into(),
            value: json!({"id": 1}),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(None));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::GetData {
            id: id.clone(),
            key: "user".into(),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(json!({"id": 1}))));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::RemoveData {
            id: id.clone(),
            key: "user".into(),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(Some(json!({"id": 1}))));

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::GetData {
            id,
            key: "user".into(),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(None));
    }

    #[tokio::test]
    async fn test_disconnect_arms_single_timer() {
        let (_tx, mut actor, _) = create_actor();
        let id = create(&mut actor);

        disconnect(&mut actor, &id);
        let first = actor.timers.get(&id).map(|t| t.generation);
        disconnect(&mut actor, &id);
        let second = actor.timers.get(&id).map(|t| t.generation);

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(actor.timers.len(), 1);
        assert_eq!(
            actor.table.snapshot(&id).unwrap().state,
            ConnectionState::GracePeriod
        );
    }

    #[tokio::test]
    async fn test_expire_with_current_generation_purges() {
        let (_tx, mut actor, mut events) = create_actor();
        let id = create(&mut actor);
        disconnect(&mut actor, &id);
        let generation = actor.timers.get(&id).unwrap().generation;

        actor.handle_command(ConnectionCommand::Expire {
            id: id.clone(),
            generation,
        });

        assert_eq!(actor.connection_count(), 0);
        assert!(actor.timers.is_empty());
        let mut saw_expired = false;
        while let Ok(event) = events.try_recv() {
            saw_expired |= event == ConnectionEvent::Expired { id: id.clone() };
        }
        assert!(saw_expired);
    }

    #[tokio::test]
    async fn test_stale_expire_ignored() {
        let (_tx, mut actor, _) = create_actor();
        let id = create(&mut actor);
        disconnect(&mut actor, &id);
        let generation = actor.timers.get(&id).unwrap().generation;

        actor.handle_command(ConnectionCommand::Expire {
            id: id.clone(),
            generation: generation + 100,
        });

        assert_eq!(actor.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_expire_after_transfer_ignored() {
        let (_tx, mut actor, _) = create_actor();
        let old = create(&mut actor);
        disconnect(&mut actor, &old);
        let generation = actor.timers.get(&old).unwrap().generation;
        let new = create(&mut actor);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Transfer {
            from: old.clone(),
            to: new.clone(),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(actor.timers.is_empty());

        actor.handle_command(ConnectionCommand::Expire { id: old, generation });
        assert_eq!(actor.connection_count(), 1);
        assert!(actor.table.get(&new).is_some());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_tx, mut actor, _) = create_actor();
        let id = create(&mut actor);
        disconnect(&mut actor, &id);

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Remove {
            id: id.clone(),
            respond_to: tx,
        });
        assert!(rx.try_recv().unwrap());
        assert!(actor.timers.is_empty());

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Remove { id, respond_to: tx });
        assert!(!rx.try_recv().unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let (_tx, mut actor, _) = create_actor();
        let (outbox, mut inbox) = mpsc::channel(4);
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Create {
            client_address: "bound".into(),
            outbox: Some(outbox),
            respond_to: tx,
        });
        let id = rx.try_recv().unwrap();

        let (tx, _) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Join {
            channel: "everyone".into(),
            id,
            respond_to: tx,
        });

        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(ConnectionCommand::Broadcast {
            channels: vec!["everyone".into(), "nobody".into()],
            message: ServerMessage::service_event("User", "create", json!({})),
            respond_to: tx,
        });
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(matches!(
            inbox.try_recv(),
            Ok(ServerMessage::ServiceEvent { .. })
        ));
    }
}
