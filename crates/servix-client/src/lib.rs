//! servix client - talk to a servix server over its Unix socket
//!
//! - [`ServixClient::call`] invokes a service method, correlated by uid,
//!   with an advisory timeout.
//! - [`ServixClient::subscribe`] yields the server's `service_event` pushes.
//! - [`ServixClient::reconnect`] opens a new transport and claims the old
//!   session via `cnx_transfer`.
//! - [`ServixClient::sync`] runs an offline reconciliation cycle.

pub mod client;
pub mod config;
pub mod error;
mod link;

pub use client::{Recovery, ServixClient};
pub use config::{ClientConfig, DEFAULT_SOCKET_PATH, SOCKET_ENV};
pub use error::{ClientError, Result};
pub use link::ServiceEvent;
