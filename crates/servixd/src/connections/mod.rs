//! Connection manager using the actor pattern.
//!
//! One task owns every connection's identity, session data, channel
//! memberships and expiration timer.
//!
//! ```text
//! ┌──────────────────┐  ConnectionCommand  ┌───────────────────┐
//! │ ConnectionsHandle│ ──────(mpsc)──────▶ │ ConnectionsActor  │
//! │ (cloned freely)  │ ◀─────(oneshot)──── │  ConnectionTable  │
//! └──────────────────┘                     │  expiry timers    │
//!                                          └─────────┬─────────┘
//!                                                    │ ConnectionEvent
//!                                                    ▼ (broadcast)
//! ```
//!
//! Lifecycle: `Connected` ─disconnect▶ `GracePeriod` ─timer▶ expired and
//! purged. A transfer moves a grace-period connection's state onto a new
//! connection before its timer fires.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;
mod table;

pub use actor::ConnectionsActor;
pub use commands::{ConnectionCommand, ConnectionError, ConnectionEvent};
pub use handle::ConnectionsHandle;
pub use table::{ConnectionEntry, ConnectionSnapshot, ConnectionTable, Outbox};

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 100;

/// Default time a disconnected session is kept for recovery (24 hours).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawns the connections actor and returns a handle to it.
pub fn spawn_connections(grace_period: Duration) -> ConnectionsHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = ConnectionsActor::new(cmd_rx, cmd_tx.downgrade(), event_tx.clone(), grace_period);
    tokio::spawn(actor.run());

    ConnectionsHandle::new(cmd_tx, event_tx)
}
