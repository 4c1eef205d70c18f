//! Static transport registry
//!
//! Endpoints never discover transports on their own. They are built from a
//! registry that maps transport names to constructors.

use std::fmt;
use std::sync::Arc;

use crate::traits::{ListenerTransport, TransportHandle};

pub type ConnectorFactory = Arc<dyn Fn() -> TransportHandle + Send + Sync>;
pub type ListenerFactory = Arc<dyn Fn() -> Arc<dyn ListenerTransport> + Send + Sync>;

/// Name to constructor tables for connecting and listening transports
#[derive(Clone, Default)]
pub struct TransportRegistry {
    connectors: Vec<(String, ConnectorFactory)>,
    listeners: Vec<(String, ListenerFactory)>,
}

impl TransportRegistry {
    /// Registry with nothing in it
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in transport enabled by features
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "loopback")]
        {
            use crate::loopback::{LoopbackListener, LoopbackTransport, LOOPBACK_NAME};
            registry.register_connector(LOOPBACK_NAME, || -> TransportHandle { LoopbackTransport::new() });
            registry.register_listener(LOOPBACK_NAME, || -> Arc<dyn ListenerTransport> {
                LoopbackListener::new()
            });
        }

        #[cfg(feature = "socket")]
        {
            use crate::socket::{SocketListener, SocketTransport, SOCKET_NAME};
            registry.register_connector(SOCKET_NAME, || -> TransportHandle { SocketTransport::new() });
            registry.register_listener(SOCKET_NAME, || -> Arc<dyn ListenerTransport> {
                SocketListener::new()
            });
        }

        registry
    }

    /// Add or replace a connecting transport constructor
    pub fn register_connector<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> TransportHandle + Send + Sync + 'static,
    {
        self.connectors.retain(|(n, _)| n != name);
        self.connectors.push((name.to_string(), Arc::new(factory)));
        self
    }

    /// Add or replace a listener transport constructor
    pub fn register_listener<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn ListenerTransport> + Send + Sync + 'static,
    {
        self.listeners.retain(|(n, _)| n != name);
        self.listeners.push((name.to_string(), Arc::new(factory)));
        self
    }

    pub fn remove(&mut self, name: &str) {
        self.connectors.retain(|(n, _)| n != name);
        self.listeners.retain(|(n, _)| n != name);
    }

    pub fn connector_names(&self) -> impl Iterator<Item = &str> {
        self.connectors.iter().map(|(n, _)| n.as_str())
    }

    pub fn listener_names(&self) -> impl Iterator<Item = &str> {
        self.listeners.iter().map(|(n, _)| n.as_str())
    }

    /// One fresh instance of every connecting transport
    pub fn create_connectors(&self) -> Vec<TransportHandle> {
        self.connectors.iter().map(|(_, f)| f()).collect()
    }

    /// One fresh instance of every listener transport
    pub fn create_listeners(&self) -> Vec<Arc<dyn ListenerTransport>> {
        self.listeners.iter().map(|(_, f)| f()).collect()
    }

    pub fn create_connector(&self, name: &str) -> Option<TransportHandle> {
        self.connectors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f())
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("connectors", &self.connector_names().collect::<Vec<_>>())
            .field("listeners", &self.listener_names().collect::<Vec<_>>())
            .finish()
    }
}
