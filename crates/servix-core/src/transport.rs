//! Where a call came from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Persistent bidirectional socket connection.
    Socket,

    /// Request/response REST adapter.
    Http,

    /// Trusted in-process call.
    Internal,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::Http => write!(f, "http"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    /// Remote client over a transport.
    Client,

    /// Server-side code calling another service.
    Server,
}
