//! servix core - shared types for the service dispatch server
//!
//! This crate provides the domain types shared between
//! the server (servixd) and clients (servix-client).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use connection::{ConnectionId, ConnectionState};
pub use error::{ErrorCode, ServiceError, ServiceResult};
pub use sync::{SyncMetadata, SyncRecord, SyncScope};
pub use transport::{CallerKind, Transport};
