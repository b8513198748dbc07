//! Shared state of a running daemon.

use std::sync::Arc;

use crate::channels::ChannelHub;
use crate::config::ServerConfig;
use crate::connections::{spawn_connections, ConnectionsHandle};
use crate::dispatch::Dispatcher;
use crate::rest::RestAdapter;
use crate::service::ServiceRegistry;
use crate::sync::{Reconciler, SyncStore};

/// Everything the transports need, built once at startup.
///
/// Cheap to clone; all parts are handles or `Arc`s.
#[derive(Clone)]
pub struct Runtime {
    connections: ConnectionsHandle,
    dispatcher: Dispatcher,
    reconciler: Arc<Reconciler>,
}

impl Runtime {
    /// Spawns the connection actor and wires the dispatcher and reconciler.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn SyncStore>,
    ) -> Self {
        let connections = spawn_connections(config.grace_period());
        let channels = ChannelHub::new(connections.clone());
        Self {
            dispatcher: Dispatcher::new(registry, channels),
            reconciler: Arc::new(Reconciler::new(store, config.stale_policy)),
            connections,
        }
    }

    pub fn connections(&self) -> &ConnectionsHandle {
        &self.connections
    }

    pub fn channels(&self) -> &ChannelHub {
        self.dispatcher.channels()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// A REST adapter over this runtime's dispatcher, without routes.
    pub fn rest(&self) -> RestAdapter {
        RestAdapter::new(self.dispatcher.clone())
    }
}
