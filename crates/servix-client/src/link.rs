//! One live transport to the server.
//!
//! After the handshake a link runs two tasks: a writer draining the
//! outbox, and a reader routing replies to the caller waiting on them.
//!
//! ```text
//!   call() ── register(uid) ──▶ pending ◀── reader ◀── socket
//!      │                                      │
//!      └──── outbox ──▶ writer ──▶ socket     └──▶ events (broadcast)
//! ```
//!
//! Dropping the link cancels both tasks, which closes the socket. Waiters
//! still registered then observe [`ClientError::Disconnected`].
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use servix_core::ConnectionId;
use servix_protocol::{ClientMessage, ProtocolVersion, ServerMessage};

use crate::error::{ClientError, Result};

/// Outbound messages buffered before `send` waits.
const OUTBOX_CAPACITY: usize = 64;

/// A `service_event` pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    pub name: String,
    pub action: String,
    pub result: Value,
}

/// What a waiting caller is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum PendingKey {
    /// `client_response` or `sync_response` with this uid
    Request(String),
    /// `cnx_transfer_ack` / `cnx_transfer_error`
    Transfer,
    /// `pong` with this seq
    Ping(u64),
}

type Pending = Arc<Mutex<HashMap<PendingKey, oneshot::Sender<ServerMessage>>>>;

pub(crate) struct Link {
    id: ConnectionId,
    outbox: mpsc::Sender<ClientMessage>,
    pending: Pending,
    closed: CancellationToken,
}

impl Link {
    /// Performs the handshake on `stream` and starts the I/O tasks.
    pub(crate) async fn establish(
        stream: UnixStream,
        client_id: Option<String>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Result<Self> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &ClientMessage::connect(client_id)).await?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Disconnected);
        }
        let id = match serde_json::from_str::<ServerMessage>(line.trim())? {
            ServerMessage::Connected {
                protocol_version,
                connection_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        server_version: protocol_version.to_string(),
                    });
                }
                connection_id
            }
            ServerMessage::Rejected { reason, .. } => {
                return Err(ClientError::Rejected { reason });
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected response to connect: {other:?}"
                )));
            }
        };
        info!(connection_id = %id, "Handshake complete");

        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let pending = Pending::default();
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(writer, outbox_rx, closed.clone()));
        tokio::spawn(read_loop(reader, pending.clone(), events, closed.clone()));

        Ok(Self {
            id,
            outbox,
            pending,
            closed,
        })
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queues a message that expects no reply.
    pub(crate) async fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Sends `message` and waits up to `timeout` for the reply under `key`.
    pub(crate) async fn request(
        &self,
        key: PendingKey,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if self.send(message).await.is_err() {
            self.pending.lock().await.remove(&key);
            return Err(ClientError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                debug!(key = ?key, ?timeout, "Request timed out");
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    debug!(message_type = ?message.message, "Sent message to server");
    Ok(())
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<ClientMessage>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                // Flush what was queued before the close (a `disconnect`).
                while let Ok(message) = outbox.try_recv() {
                    if write_message(&mut writer, &message).await.is_err() {
                        break;
                    }
                }
                break;
            }
            message = outbox.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!(error = %e, "Write failed, closing link");
                    break;
                }
            }
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: Pending,
    events: broadcast::Sender<ServiceEvent>,
    closed: CancellationToken,
) {
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read_line(&mut line) => match read {
                Ok(0) => {
                    info!("Server closed connection");
                    break;
                }
                Ok(_) => match serde_json::from_str::<ServerMessage>(line.trim()) {
                    Ok(message) => route(message, &pending, &events).await,
                    Err(e) => warn!(error = %e, line = %line.trim(), "Failed to parse server message"),
                },
                Err(e) => {
                    warn!(error = %e, "Read failed, closing link");
                    break;
                }
            }
        }
    }
    closed.cancel();
    // Dropping the senders wakes every waiter with Disconnected.
    pending.lock().await.clear();
}

async fn route(message: ServerMessage, pending: &Pending, events: &broadcast::Sender<ServiceEvent>) {
    let key = match &message {
        ServerMessage::ClientResponse(response) => PendingKey::Request(response.uid.clone()),
        ServerMessage::SyncResponse(response) => PendingKey::Request(response.uid.clone()),
        ServerMessage::CnxTransferAck { .. } | ServerMessage::CnxTransferError { .. } => {
            PendingKey::Transfer
        }
        ServerMessage::Pong { seq } => PendingKey::Ping(*seq),
        ServerMessage::ServiceEvent {
            name,
            action,
            result,
        } => {
            debug!(service = %name, action = %action, "Service event");
            // No subscribers is fine.
            let _ = events.send(ServiceEvent {
                name: name.clone(),
                action: action.clone(),
                result: result.clone(),
            });
            return;
        }
        ServerMessage::Error { message, code } => {
            warn!(error_message = %message, error_code = ?code, "Received error from server");
            return;
        }
        ServerMessage::Connected { .. } | ServerMessage::Rejected { .. } => {
            warn!("Received unexpected handshake message after connection");
            return;
        }
    };

    let waiter = pending.lock().await.remove(&key);
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!(key = ?key, "Reply without a waiter (timed out?)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use servix_core::ServiceError;

    /// Plays the server side of a stream pair.
    struct FakeServer {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl FakeServer {
        async fn recv(&mut self) -> ClientMessage {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, message: ServerMessage) {
            let json = serde_json::to_string(&message).unwrap();
            self.writer.write_all(json.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    async fn linked() -> (Link, FakeServer, broadcast::Receiver<ServiceEvent>) {
        let (client, server) = UnixStream::pair().unwrap();
        let (reader, writer) = server.into_split();
        let mut server = FakeServer {
            reader: BufReader::new(reader),
            writer,
        };
        let (events, events_rx) = broadcast::channel(16);

        let accept = async {
            let hello = server.recv().await;
            assert!(matches!(hello.message, servix_protocol::MessageType::Connect { .. }));
            server
                .send(ServerMessage::connected(ConnectionId::from_counter(1)))
                .await;
        };
        let (link, ()) = tokio::join!(Link::establish(client, None, events), accept);
        (link.unwrap(), server, events_rx)
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (client, server) = UnixStream::pair().unwrap();
        let (reader, writer) = server.into_split();
        let mut server = FakeServer {
            reader: BufReader::new(reader),
            writer,
        };
        let (events, _) = broadcast::channel(4);

        let refuse = async {
            server.recv().await;
            server.send(ServerMessage::rejected("go away")).await;
        };
        let (result, ()) = tokio::join!(Link::establish(client, None, events), refuse);
        assert!(matches!(result, Err(ClientError::Rejected { reason }) if reason == "go away"));
    }

    #[tokio::test]
    async fn test_replies_routed_by_uid() {
        let (link, mut server, _events) = linked().await;
        assert_eq!(link.id().as_str(), "cnx-1");
        let timeout = Duration::from_secs(2);

        let first = link.request(
            PendingKey::Request("a".into()),
            ClientMessage::request("a", "S", "m", vec![]),
            timeout,
        );
        let second = link.request(
            PendingKey::Request("b".into()),
            ClientMessage::request("b", "S", "m", vec![]),
            timeout,
        );
        let answer = async {
            server.recv().await;
            server.recv().await;
            // Out of order on purpose.
            server.send(ServerMessage::response("b", Ok(json!(2)))).await;
            server
                .send(ServerMessage::response("a", Err(ServiceError::bad_request("no"))))
                .await;
        };
        let (first, second, ()) = tokio::join!(first, second, answer);

        match first.unwrap() {
            ServerMessage::ClientResponse(r) => assert!(r.into_result().is_err()),
            other => panic!("unexpected {other:?}"),
        }
        match second.unwrap() {
            ServerMessage::ClientResponse(r) => assert_eq!(r.into_result().unwrap(), json!(2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_broadcast_to_subscribers() {
        let (_link, mut server, mut events) = linked().await;
        server
            .send(ServerMessage::service_event("User", "create", json!({"uid": "u1"})))
            .await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name, "User");
        assert_eq!(event.action, "create");
    }

    #[tokio::test]
    async fn test_timeout_is_advisory() {
        let (link, mut server, _events) = linked().await;
        let err = link
            .request(
                PendingKey::Request("slow".into()),
                ClientMessage::request("slow", "S", "m", vec![]),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        // A late reply is dropped and the link keeps working.
        server.recv().await;
        server.send(ServerMessage::response("slow", Ok(json!(1)))).await;
        let pong = link.request(PendingKey::Ping(9), ClientMessage::ping(9), Duration::from_secs(2));
        let answer = async {
            server.recv().await;
            server.send(ServerMessage::pong(9)).await;
        };
        let (pong, ()) = tokio::join!(pong, answer);
        assert!(matches!(pong.unwrap(), ServerMessage::Pong { seq: 9 }));
    }

    #[tokio::test]
    async fn test_server_close_wakes_waiters() {
        let (link, server, _events) = linked().await;
        let waiting = link.request(
            PendingKey::Request("x".into()),
            ClientMessage::request("x", "S", "m", vec![]),
            Duration::from_secs(5),
        );
        let close = async move {
            let mut server = server;
            server.recv().await;
            drop(server);
        };
        let (result, ()) = tokio::join!(waiting, close);
        assert!(matches!(result, Err(ClientError::Disconnected)));
        assert!(link.is_closed());
    }
}
