//! Shared helpers for the servixd integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use servix_core::ConnectionId;
use servix_protocol::{ClientMessage, ClientResponse, MessageType, ProtocolVersion, ServerMessage};
use servixd::config::ServerConfig;
use servixd::runtime::Runtime;
use servixd::server::DaemonServer;
use servixd::service::ServiceRegistry;
use servixd::sync::MemoryStore;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound for any single expected message
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to listen when asserting that nothing arrives
pub const SILENCE_WINDOW: Duration = Duration::from_millis(150);

// ============================================================================
// TestServer
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
pub struct TestServer {
    pub socket_path: PathBuf,
    pub runtime: Runtime,
    pub store: Arc<MemoryStore>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    /// Spawns a server over `registry`; `configure` adjusts the config
    /// before the socket path is filled in.
    pub async fn spawn_with(
        registry: Arc<ServiceRegistry>,
        store: Arc<MemoryStore>,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let mut config = ServerConfig::default();
        configure(&mut config);
        config.socket_path = socket_path.clone();

        let runtime = Runtime::new(&config, registry, store.clone());
        let cancel_token = CancellationToken::new();
        let server = DaemonServer::new(&config, runtime.clone(), cancel_token.clone());

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            runtime,
            store,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    /// Spawns a server serving the demo application.
    pub async fn spawn_demo(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = servixd::demo::registry(store.clone()).expect("demo registry");
        Self::spawn_with(registry, store, configure).await
    }

    pub async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Waits until the connection manager reports `id` in its grace period.
    pub async fn wait_for_grace_period(&self, id: &ConnectionId) {
        let connections = self.runtime.connections().clone();
        let id = id.clone();
        timeout(RECV_TIMEOUT, async move {
            loop {
                if let Some(snapshot) = connections.get(&id).await {
                    if !snapshot.state.is_connected() {
                        return;
                    }
                }
                sleep(SOCKET_POLL_INTERVAL).await;
            }
        })
        .await
        .expect("connection entered grace period");
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

// ============================================================================
// TestClient
// ============================================================================

/// Test client connection with protocol helpers.
pub struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    pub fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Receives the next message, failing the test after [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> ServerMessage {
        let mut line = String::new();
        let read = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("message within timeout")
            .unwrap();
        assert!(read > 0, "server closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Asserts that nothing arrives for [`SILENCE_WINDOW`].
    pub async fn expect_silence(&mut self) {
        let mut line = String::new();
        if let Ok(read) = timeout(SILENCE_WINDOW, self.reader.read_line(&mut line)).await {
            let read = read.unwrap();
            assert!(read == 0, "unexpected message: {line}");
        }
    }

    pub async fn handshake(&mut self) -> ConnectionId {
        self.send(ClientMessage::connect(Some("test-client".to_string())))
            .await;
        match self.recv().await {
            ServerMessage::Connected { connection_id, .. } => connection_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    pub async fn handshake_with_version(&mut self, version: ProtocolVersion) -> ServerMessage {
        self.send(ClientMessage {
            protocol_version: version,
            message: MessageType::Connect { client_id: None },
        })
        .await;
        self.recv().await
    }

    pub async fn request(&mut self, uid: &str, name: &str, action: &str, args: Vec<Value>) {
        self.send(ClientMessage::request(uid, name, action, args)).await;
    }

    /// Reads until the response for `uid`, returning it together with
    /// every other message seen on the way.
    pub async fn response_for(&mut self, uid: &str) -> (ClientResponse, Vec<ServerMessage>) {
        let mut others = Vec::new();
        loop {
            match self.recv().await {
                ServerMessage::ClientResponse(response) if response.uid == uid => {
                    return (response, others);
                }
                other => others.push(other),
            }
        }
    }

    /// Sends a request and waits for its response.
    pub async fn call(&mut self, uid: &str, name: &str, action: &str, args: Vec<Value>) -> ClientResponse {
        self.request(uid, name, action, args).await;
        self.response_for(uid).await.0
    }
}

/// Service events among `messages`.
pub fn service_events(messages: &[ServerMessage]) -> Vec<(String, String, Value)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ServiceEvent {
                name,
                action,
                result,
            } => Some((name.clone(), action.clone(), result.clone())),
            _ => None,
        })
        .collect()
}
