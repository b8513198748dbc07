//! Client connection settings.

use std::path::PathBuf;
use std::time::Duration;

/// Default socket path, shared with the server.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/servix.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "SERVIX_SOCKET";

/// Connection behavior for [`crate::ServixClient`].
///
/// # Example
///
/// ```rust
/// use servix_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     request_timeout: Duration::from_secs(5),
///     ..ClientConfig::default()
/// };
/// assert_eq!(config.connect_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the server's Unix socket.
    pub socket_path: PathBuf,

    /// Free-form label sent in the handshake; the server only logs it.
    pub client_id: Option<String>,

    /// How long a call waits for its reply. Advisory: the server is not
    /// told when a caller gives up.
    pub request_timeout: Duration,

    /// Connection attempts before giving up, including the first.
    pub connect_attempts: u32,

    /// Delay before the first retry.
    pub retry_initial_delay: Duration,

    /// Upper bound on the delay between retries.
    pub retry_max_delay: Duration,

    /// Backoff multiplier (2.0 doubles the delay each retry).
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            request_timeout: Duration::from_secs(30),
            connect_attempts: 5,
            retry_initial_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            retry_multiplier: 2.0,
        }
    }
}

impl ClientConfig {
    /// Defaults with the socket path taken from `SERVIX_SOCKET` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var(SOCKET_ENV) {
            config.socket_path = PathBuf::from(path);
        }
        config
    }

    pub fn with_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Delay to wait after a failed attempt that waited `delay` before it.
    pub(crate) fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}
