//! servix daemon - service dispatch, pub/sub channels, session recovery
//! and offline sync
//!
//! - `service` - service definitions, hooks and the frozen registry
//! - `dispatch` - the hook pipeline every transport calls through
//! - `connections` - connection manager actor (sessions, grace period, channels)
//! - `transfer` - moving a session onto a reconnected transport
//! - `sync` - offline reconciliation engine
//! - `server` - Unix socket server
//! - `rest` - request/response adapter
//! - `demo` - the `User`/`Post`/`authenticate` application `servixd start` serves
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        servixd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐     ┌──────────────┐                   │
//! │  │  DaemonServer   │────▶│  Dispatcher  │◀──── RestAdapter  │
//! │  │ (Unix socket)   │     └──────┬───────┘                   │
//! │  └────────┬────────┘            │ hooks, method, publish    │
//! │           │                     ▼                           │
//! │           │            ┌──────────────────┐                 │
//! │           └───────────▶│ ConnectionsActor │                 │
//! │                        │ (sessions, chans)│                 │
//! │  sync_request          └──────────────────┘                 │
//! │      │                                                      │
//! │      ▼                                                      │
//! │  ┌─────────────┐      ┌─────────────┐                       │
//! │  │ Reconciler  │─────▶│  SyncStore  │                       │
//! │  └─────────────┘      └─────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod channels;
pub mod config;
pub mod connections;
pub mod database;
pub mod demo;
pub mod dispatch;
pub mod rest;
pub mod runtime;
pub mod server;
pub mod service;
pub mod sync;
pub mod transfer;
