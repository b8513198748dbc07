//! The servix socket client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use servix_core::ConnectionId;
use servix_protocol::{ClientMessage, ServerMessage, SyncOutcome, SyncRequest};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::link::{Link, PendingKey, ServiceEvent};

/// Service events buffered per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 256;

/// Result of [`ServixClient::reconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The previous session (data and channels) now lives on the new
    /// connection.
    Restored { previous: ConnectionId },

    /// The server refused the transfer; this is a fresh session.
    Fresh {
        previous: ConnectionId,
        reason: String,
    },
}

/// Client for a servix server.
///
/// Calls are correlated by a random uid, so any number may be in flight.
/// Service events are fanned out to every [`ServixClient::subscribe`]r and
/// subscriptions survive [`ServixClient::reconnect`].
///
/// # Example
///
/// ```rust,ignore
/// use servix_client::{ClientConfig, ServixClient};
/// use serde_json::json;
///
/// let client = ServixClient::connect(ClientConfig::from_env()).await?;
/// let user = client.call("User", "create", vec![json!({"username": "ada"})]).await?;
/// ```
pub struct ServixClient {
    config: ClientConfig,
    link: Link,
    events: broadcast::Sender<ServiceEvent>,
    next_seq: AtomicU64,
}

impl ServixClient {
    /// Connects and performs the handshake, retrying with exponential
    /// backoff up to `config.connect_attempts` times.
    ///
    /// # Errors
    ///
    /// The last connection error once attempts run out. Handshake failures
    /// (version mismatch, rejection) are not retried.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let link = connect_with_retry(&config, &events).await?;
        Ok(Self {
            config,
            link,
            events,
            next_seq: AtomicU64::new(1),
        })
    }

    /// Identity the server assigned to the current transport.
    pub fn connection_id(&self) -> &ConnectionId {
        self.link.id()
    }

    /// True once the transport has closed; call [`Self::reconnect`].
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receives every `service_event` pushed to this client.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Runs `handler` on the result of every `service.action` event until
    /// the returned task is aborted or the client is dropped.
    pub fn on<F>(&self, service: &str, action: &str, handler: F) -> JoinHandle<()>
    where
        F: Fn(Value) + Send + 'static,
    {
        let mut events = self.subscribe();
        let (service, action) = (service.to_string(), action.to_string());
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.name == service && event.action == action => {
                        handler(event.result);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(service = %service, action = %action, skipped, "Event handler lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Invokes `service.action(args...)` and waits for its result.
    ///
    /// # Errors
    ///
    /// [`ClientError::Service`] when the service (or a hook) failed,
    /// [`ClientError::Timeout`] when no reply came within
    /// `request_timeout`, transport errors otherwise.
    pub async fn call(&self, service: &str, action: &str, args: Vec<Value>) -> Result<Value> {
        let uid = Uuid::new_v4().to_string();
        debug!(uid = %uid, service, action, "Calling");

        let reply = self
            .link
            .request(
                PendingKey::Request(uid.clone()),
                ClientMessage::request(uid, service, action, args),
                self.config.request_timeout,
            )
            .await?;

        match reply {
            ServerMessage::ClientResponse(response) => Ok(response.into_result()?),
            other => Err(unexpected("client_response", &other)),
        }
    }

    /// Runs one reconciliation cycle. The request's uid is replaced with a
    /// fresh one.
    pub async fn sync(&self, mut request: SyncRequest) -> Result<SyncOutcome> {
        request.uid = Uuid::new_v4().to_string();
        let key = PendingKey::Request(request.uid.clone());
        let reply = self
            .link
            .request(key, ClientMessage::sync(request), self.config.request_timeout)
            .await?;

        match reply {
            ServerMessage::SyncResponse(response) => Ok(response.into_result()?),
            other => Err(unexpected("sync_response", &other)),
        }
    }

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        self.link
            .request(
                PendingKey::Ping(seq),
                ClientMessage::ping(seq),
                self.config.request_timeout,
            )
            .await?;
        Ok(started.elapsed())
    }

    /// Opens a new transport and claims the previous connection's session.
    ///
    /// In-flight calls on the old transport fail with
    /// [`ClientError::Disconnected`]. A refused transfer still leaves the
    /// client connected, on a fresh session.
    pub async fn reconnect(&mut self) -> Result<Recovery> {
        let previous = self.link.id().clone();
        let link = connect_with_retry(&self.config, &self.events).await?;
        let current = link.id().clone();

        let reply = link
            .request(
                PendingKey::Transfer,
                ClientMessage::transfer(previous.clone(), current.clone()),
                self.config.request_timeout,
            )
            .await;
        self.link = link;

        match reply? {
            ServerMessage::CnxTransferAck { .. } => {
                info!(from = %previous, to = %current, "Session restored");
                Ok(Recovery::Restored { previous })
            }
            ServerMessage::CnxTransferError { reason, .. } => {
                warn!(from = %previous, to = %current, reason = %reason, "Session not restored");
                Ok(Recovery::Fresh { previous, reason })
            }
            other => Err(unexpected("cnx_transfer_ack", &other)),
        }
    }

    /// Says goodbye and closes the transport. The server keeps the session
    /// for its grace period.
    pub async fn disconnect(self) -> Result<()> {
        self.link.send(ClientMessage::disconnect()).await
    }
}

async fn connect_with_retry(
    config: &ClientConfig,
    events: &broadcast::Sender<ServiceEvent>,
) -> Result<Link> {
    let attempts = config.connect_attempts.max(1);
    let mut delay = config.retry_initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(
            attempt,
            socket_path = %config.socket_path.display(),
            "Attempting to connect to server"
        );

        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                return Link::establish(stream, config.client_id.clone(), events.clone()).await;
            }
            Err(source) if attempt >= attempts => {
                return Err(ClientError::Connect {
                    path: config.socket_path.clone(),
                    source,
                });
            }
            Err(e) => {
                debug!(attempt, error = %e, "Connection attempt failed");
            }
        }

        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}

fn unexpected(expected: &str, got: &ServerMessage) -> ClientError {
    ClientError::Protocol(format!("expected {expected}, got {got:?}"))
}
