//! Connection handler for individual client transports.
//!
//! Each accepted socket gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Registers the transport with the connection manager and joins the
//!   default channels
//! - Spawns one task per `client_request` / `sync_request`
//! - Answers transfers inline, so they are ordered with later requests
//! - Moves the connection into its grace period when the transport drops
//!
//! All outbound traffic (responses, pushes, broadcasts) goes through one
//! bounded outbox drained by a dedicated writer task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use servix_core::{ConnectionId, ServiceError};
use servix_protocol::{ClientMessage, MessageType, ProtocolVersion, ServerMessage, SyncRequest, SyncResponse};

use crate::config::ServerConfig;
use crate::connections::Outbox;
use crate::dispatch::truncate_for_log;
use crate::runtime::Runtime;
use crate::service::{Caller, ConnectionRef};

/// Outbox capacity per connection
pub const OUTBOX_CAPACITY: usize = 256;

/// Per-connection limits, taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub default_channels: Vec<String>,
}

impl From<&ServerConfig> for HandlerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            default_channels: config.default_channels.clone(),
        }
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Connection handler for a single client transport.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Write half; handed to the writer task after the handshake
    writer: Option<BufWriter<OwnedWriteHalf>>,

    runtime: Runtime,
    settings: HandlerSettings,
    cancel_token: CancellationToken,

    /// Identity assigned by the connection manager after the handshake
    connection_id: Option<ConnectionId>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        runtime: Runtime,
        settings: HandlerSettings,
        cancel_token: CancellationToken,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Some(BufWriter::new(writer)),
            runtime,
            settings,
            cancel_token,
            connection_id: None,
            connection_number,
        }
    }

    /// Runs the handshake and then the message loop until the transport
    /// closes. Returns the connection id, if one was assigned.
    pub async fn run(mut self) -> Option<ConnectionId> {
        debug!(connection = self.connection_number, "New client connected");

        let outbox = match self.handle_handshake().await {
            Ok(outbox) => outbox,
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        };

        let connection_id = self.connection_id.clone()?;
        info!(connection_id = %connection_id, "Client handshake completed");

        if let Err(e) = self.process_messages(&connection_id, &outbox).await {
            debug!(connection_id = %connection_id, error = %e, "Connection closed");
        }

        // In-flight request tasks keep their own outbox clones.
        drop(outbox);

        match self.runtime.connections().disconnect(&connection_id).await {
            Ok(()) => info!(connection_id = %connection_id, "Client disconnected, session kept for grace period"),
            Err(e) => debug!(connection_id = %connection_id, error = %e, "Disconnect after transport close"),
        }
        Some(connection_id)
    }

    /// Expects `connect`, checks the protocol version, registers the
    /// connection and sends `connected`.
    async fn handle_handshake(&mut self) -> Result<Outbox, HandlerError> {
        let msg = match timeout(self.settings.read_timeout, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(HandlerError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.write_direct(ServerMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(HandlerError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        let client_id = match msg.message {
            MessageType::Connect { client_id } => client_id,
            other => {
                self.write_direct(ServerMessage::error("Expected connect message for handshake"))
                    .await?;
                return Err(HandlerError::UnexpectedMessage(format!("{other:?}")));
            }
        };

        let writer = self.writer.take().ok_or(HandlerError::Eof)?;
        let (outbox, mailbox) = mpsc::channel(OUTBOX_CAPACITY);
        let address = client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));

        let connections = self.runtime.connections();
        let connection_id = connections
            .create(address, Some(outbox.clone()))
            .await
            .map_err(|e| HandlerError::Connections(e.to_string()))?;

        tokio::spawn(write_loop(
            writer,
            mailbox,
            self.settings.write_timeout,
            connection_id.clone(),
        ));

        // Queued before any membership exists, so it is always first.
        outbox
            .send(ServerMessage::connected(connection_id.clone()))
            .await
            .map_err(|_| HandlerError::OutboxClosed)?;

        for channel in &self.settings.default_channels {
            if let Err(e) = connections.join(channel, &connection_id).await {
                warn!(connection_id = %connection_id, channel, error = %e, "Failed to join default channel");
            }
        }

        self.connection_id = Some(connection_id);
        Ok(outbox)
    }

    /// Reads and routes messages until EOF, `disconnect`, idle timeout or
    /// server shutdown.
    async fn process_messages(
        &mut self,
        connection_id: &ConnectionId,
        outbox: &Outbox,
    ) -> Result<(), HandlerError> {
        let cancel_token = self.cancel_token.clone();
        loop {
            let read = tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(connection_id = %connection_id, "Server shutting down, closing connection");
                    return Ok(());
                }
                read = timeout(self.settings.read_timeout, self.read_message()) => read,
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(HandlerError::Eof)) => {
                    debug!(connection_id = %connection_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e @ (HandlerError::Parse(_) | HandlerError::MessageTooLarge { .. }))) => {
                    warn!(connection_id = %connection_id, error = %e, "Rejected client message");
                    send(outbox, ServerMessage::error_with_code(&e.to_string(), "bad-request")).await;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(connection_id = %connection_id, "Connection timed out");
                    return Err(HandlerError::Timeout);
                }
            };

            if !self.handle_message(msg, connection_id, outbox).await {
                debug!(connection_id = %connection_id, "Client requested disconnect");
                return Ok(());
            }
        }
    }

    /// Routes one message. Returns false when the client asked to leave.
    async fn handle_message(
        &self,
        msg: ClientMessage,
        connection_id: &ConnectionId,
        outbox: &Outbox,
    ) -> bool {
        match msg.message {
            MessageType::Connect { .. } => {
                send(outbox, ServerMessage::error("Already connected")).await;
            }

            MessageType::ClientRequest {
                uid,
                name,
                action,
                args,
            } => {
                let caller = Caller::socket(ConnectionRef::new(
                    connection_id.clone(),
                    self.runtime.connections().clone(),
                ));
                let dispatcher = self.runtime.dispatcher().clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let result = dispatcher.invoke(caller, &name, &action, args).await;
                    if let Err(ref e) = result {
                        debug!(uid = %uid, service = %name, method = %action, code = %e.code, "Call failed");
                    }
                    send(&outbox, ServerMessage::response(uid, result)).await;
                });
            }

            MessageType::CnxTransfer { from_id, to_id } => {
                let reply = self.handle_transfer(from_id, to_id, connection_id).await;
                send(outbox, reply).await;
            }

            MessageType::SyncRequest(request) => {
                let reconciler = self.runtime.reconciler().clone();
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let response = run_sync(&reconciler, request).await;
                    send(&outbox, ServerMessage::SyncResponse(response)).await;
                });
            }

            MessageType::Ping { seq } => {
                send(outbox, ServerMessage::pong(seq)).await;
            }

            MessageType::Disconnect => return false,
        }
        true
    }

    async fn handle_transfer(
        &self,
        from_id: ConnectionId,
        to_id: ConnectionId,
        requester: &ConnectionId,
    ) -> ServerMessage {
        if &to_id != requester {
            warn!(
                requester = %requester,
                from = %from_id,
                to = %to_id,
                "Transfer targeting another connection refused"
            );
            let err = crate::transfer::TransferError::Forbidden {
                requester: requester.clone(),
                target: to_id,
            };
            return ServerMessage::transfer_error(from_id, err.to_string());
        }

        match self.runtime.connections().transfer(&from_id, &to_id).await {
            Ok(()) => ServerMessage::transfer_ack(to_id),
            Err(e) => {
                info!(from = %from_id, to = %to_id, reason = %e, "Transfer refused");
                ServerMessage::transfer_error(from_id, e.to_string())
            }
        }
    }

    /// Reads a single newline-terminated message.
    async fn read_message(&mut self) -> Result<ClientMessage, HandlerError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(HandlerError::Eof);
        }

        if line.len() > self.settings.max_message_size {
            return Err(HandlerError::MessageTooLarge {
                size: line.len(),
                max: self.settings.max_message_size,
            });
        }

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| HandlerError::Parse(e.to_string()))?;

        debug!(
            connection_id = ?self.connection_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Writes straight to the socket; only used before the writer task
    /// owns it.
    async fn write_direct(&mut self, msg: ServerMessage) -> Result<(), HandlerError> {
        let write_timeout = self.settings.write_timeout;
        let writer = self.writer.as_mut().ok_or(HandlerError::Eof)?;
        write_frame(writer, &msg, write_timeout).await
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }
}

async fn run_sync(reconciler: &crate::sync::Reconciler, request: SyncRequest) -> SyncResponse {
    let uid = request.uid.clone();
    let result = reconciler
        .reconcile(&request)
        .await
        .map_err(ServiceError::from);
    if let Err(ref e) = result {
        warn!(uid = %uid, model = %request.scope.model, error = %e, "Sync cycle aborted");
    }
    SyncResponse::from_result(uid, result)
}

/// Queues a message, waiting for outbox space.
async fn send(outbox: &Outbox, msg: ServerMessage) {
    if outbox.send(msg).await.is_err() {
        debug!("Outbox closed, dropping message");
    }
}

async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &ServerMessage,
    write_timeout: Duration,
) -> Result<(), HandlerError> {
    let json = serde_json::to_string(msg).map_err(|e| HandlerError::Parse(e.to_string()))?;

    match timeout(write_timeout, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerError::Io(e.to_string())),
        Err(_) => Err(HandlerError::WriteTimeout),
    }
}

/// Drains the outbox onto the socket until every sender is gone or a
/// write fails.
async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut mailbox: mpsc::Receiver<ServerMessage>,
    write_timeout: Duration,
    connection_id: ConnectionId,
) {
    while let Some(msg) = mailbox.recv().await {
        if let ServerMessage::ClientResponse(ref response) = msg {
            debug!(
                connection_id = %connection_id,
                uid = %response.uid,
                result = %response.result.as_ref().map(truncate_for_log).unwrap_or_default(),
                "Sending response"
            );
        }
        if let Err(e) = write_frame(&mut writer, &msg, write_timeout).await {
            debug!(connection_id = %connection_id, error = %e, "Write failed, closing writer");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection manager error: {0}")]
    Connections(String),

    #[error("Outbox closed")]
    OutboxClosed,
}
