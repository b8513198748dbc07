//! servix protocol - wire messages for the socket transport
//!
//! Every message is one JSON object per line, tagged by `type`.
//! Clients send [`ClientMessage`]s; the server answers with
//! [`ServerMessage`]s and pushes `service_event`s to channel members.

pub mod message;
pub mod sync;
pub mod version;

pub use message::{ClientMessage, ClientResponse, MessageType, ServerMessage};
pub use sync::{SyncEntry, SyncOutcome, SyncRequest, SyncResponse};
pub use version::{ProtocolVersion, VersionError};
