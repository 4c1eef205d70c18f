//! Endpoint builders
//!
//! Every endpoint kind is assembled the same way: transports come from a
//! [`TransportRegistry`] (the built-in ones by default) plus any handed in
//! directly, then the configuration, queue and callbacks are applied.
//! Building needs a tokio runtime unless a scheduler is supplied.

use std::sync::Arc;
use std::time::Duration;
use trap_core::{Configuration, ENDPOINT_ID_CLIENT};
use trap_transport::{Authentication, ListenerTransport, Transport, TransportHandle, TransportRegistry};

use crate::client::{ClientEndpoint, ClientRole};
use crate::delegate::Delegates;
use crate::endpoint::EndpointInner;
use crate::error::Result;
use crate::listener::ListenerEndpoint;
use crate::peer::{PeerEndpoint, PeerRole};
use crate::queue::{QueueFactory, QueueType};
use crate::scheduler::{IdGenerator, Scheduler, TokioScheduler, UuidGenerator};

/// Settings every builder shares
#[derive(Default)]
struct Common {
    registry: Option<TransportRegistry>,
    configuration: Configuration,
    delegates: Delegates,
    queue: Option<Arc<dyn QueueFactory>>,
    blocking_timeout: Option<Duration>,
    auth: Option<Arc<dyn Authentication>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl Common {
    fn registry(&self) -> TransportRegistry {
        self.registry.clone().unwrap_or_else(TransportRegistry::with_defaults)
    }

    fn runtime(&self) -> Result<(Arc<dyn Scheduler>, Arc<dyn IdGenerator>)> {
        let scheduler: Arc<dyn Scheduler> = match &self.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => Arc::new(TokioScheduler::current()?),
        };
        let ids: Arc<dyn IdGenerator> = self.ids.clone().unwrap_or_else(|| Arc::new(UuidGenerator));
        Ok((scheduler, ids))
    }

    fn connectors(&self, extra: &[TransportHandle]) -> Vec<TransportHandle> {
        self.registry()
            .create_connectors()
            .into_iter()
            .filter(|t| t.can_connect())
            .chain(extra.iter().cloned())
            .collect()
    }

    fn listener(&self, extra: &[Arc<dyn ListenerTransport>]) -> Result<ListenerEndpoint> {
        let (scheduler, ids) = self.runtime()?;
        let mut listeners = self.registry().create_listeners();
        listeners.extend(extra.iter().cloned());

        let listener = ListenerEndpoint::from_listeners(listeners, scheduler, ids);
        listener.inner.configure(self.configuration.clone());
        if let Some(auth) = &self.auth {
            listener.set_authentication(auth.clone());
        }
        if let Some(queue) = &self.queue {
            listener.set_queue_factory(queue.clone());
        }
        if self.blocking_timeout.is_some() {
            listener.set_blocking_timeout(self.blocking_timeout);
        }
        Ok(listener)
    }

    fn endpoint(&self, inner: &Arc<EndpointInner>, transports: &[TransportHandle]) {
        if let Some(auth) = &self.auth {
            inner.set_authentication(auth.clone());
        }
        if let Some(queue) = &self.queue {
            inner.set_queue_factory(queue.clone());
        }
        if self.blocking_timeout.is_some() {
            inner.set_blocking_timeout(self.blocking_timeout);
        }
        for transport in transports {
            inner.add_transport(transport);
        }
        inner.apply_configuration(self.configuration.clone());
        inner.handle().set_delegates(self.delegates.clone(), true);
    }
}

macro_rules! common_setters {
    () => {
        /// Take transports from this registry instead of the built-in one
        pub fn registry(mut self, registry: TransportRegistry) -> Self {
            self.common.registry = Some(registry);
            self
        }

        /// Configuration text, `key = value` per line. Repeated calls merge.
        pub fn configuration(mut self, text: &str) -> Self {
            self.common.configuration.merge_text(text);
            self
        }

        pub fn option(mut self, key: &str, value: impl ToString) -> Self {
            self.common.configuration.set_option(key, value);
            self
        }

        pub fn delegates(mut self, delegates: Delegates) -> Self {
            self.common.delegates = delegates;
            self
        }

        pub fn queue_type(mut self, queue_type: QueueType) -> Self {
            self.common.queue = Some(Arc::new(queue_type));
            self
        }

        pub fn queue_factory(mut self, factory: Arc<dyn QueueFactory>) -> Self {
            self.common.queue = Some(factory);
            self
        }

        /// How long a send may block on a full blocking queue
        pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
            self.common.blocking_timeout = Some(timeout);
            self
        }

        pub fn authentication(mut self, auth: Arc<dyn Authentication>) -> Self {
            self.common.auth = Some(auth);
            self
        }

        pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
            self.common.scheduler = Some(scheduler);
            self
        }

        pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
            self.common.ids = Some(ids);
            self
        }
    };
}

// ============================================================================
// Client
// ============================================================================

/// Builder for [`ClientEndpoint`]
pub struct ClientBuilder {
    common: Common,
    transports: Vec<TransportHandle>,
    auto_configure: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            common: Common::default(),
            transports: Vec::new(),
            auto_configure: true,
        }
    }

    common_setters!();

    /// Add a transport next to the registry's
    pub fn transport<T: Transport + 'static>(mut self, transport: Arc<T>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Let the server replace our configuration when it has a newer one
    pub fn auto_configure(mut self, enabled: bool) -> Self {
        self.auto_configure = enabled;
        self
    }

    pub fn build(self) -> Result<ClientEndpoint> {
        let (scheduler, ids) = self.common.runtime()?;
        let role = ClientRole::new(self.auto_configure);
        let inner = EndpointInner::new(role.clone(), scheduler, ids);
        inner.set_trap_id(ENDPOINT_ID_CLIENT);
        inner.set_max_active(1);

        let transports = self.common.connectors(&self.transports);
        self.common.endpoint(&inner, &transports);
        Ok(ClientEndpoint::from_parts(inner.handle(), role))
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Builder for [`ListenerEndpoint`]
pub struct ListenerBuilder {
    common: Common,
    listeners: Vec<Arc<dyn ListenerTransport>>,
}

impl Default for ListenerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerBuilder {
    pub fn new() -> Self {
        Self {
            common: Common::default(),
            listeners: Vec::new(),
        }
    }

    common_setters!();

    /// Add a listening transport next to the registry's
    pub fn listener(mut self, listener: Arc<dyn ListenerTransport>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Callbacks given here are kept unless [`ListenerEndpoint::listen`]
    /// fills the same slot.
    pub fn build(self) -> Result<ListenerEndpoint> {
        let listener = self.common.listener(&self.listeners)?;
        listener.inner.merge_delegates(self.common.delegates.clone());
        Ok(listener)
    }
}

// ============================================================================
// Peer
// ============================================================================

/// Builder for [`PeerEndpoint`]
pub struct PeerBuilder {
    common: Common,
    transports: Vec<TransportHandle>,
    listeners: Vec<Arc<dyn ListenerTransport>>,
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerBuilder {
    pub fn new() -> Self {
        Self {
            common: Common::default(),
            transports: Vec::new(),
            listeners: Vec::new(),
        }
    }

    common_setters!();

    /// Add a connecting transport next to the registry's
    pub fn transport<T: Transport + 'static>(mut self, transport: Arc<T>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Add a listening transport next to the registry's
    pub fn listener(mut self, listener: Arc<dyn ListenerTransport>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<PeerEndpoint> {
        let (scheduler, ids) = self.common.runtime()?;
        let listener = self.common.listener(&self.listeners)?;
        let connectors = self.common.connectors(&self.transports);

        let role = PeerRole::new(listener.clone(), connectors);
        let inner = EndpointInner::new(role.clone(), scheduler, ids.clone());
        inner.set_trap_id(ids.generate());
        inner.set_max_active(usize::MAX);
        listener.inner.set_target(&inner);

        self.common.endpoint(&inner, &[]);
        Ok(PeerEndpoint::from_parts(inner.handle(), role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKind;
    use crate::state::EndpointState;
    use trap_test_utils::MockTransport;

    #[test]
    fn test_build_needs_runtime() {
        let built = ClientBuilder::new().registry(TransportRegistry::new()).build();
        assert!(matches!(built, Err(crate::error::TrapError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_client_defaults() {
        let client = ClientBuilder::new()
            .registry(TransportRegistry::new())
            .transport(MockTransport::new("mock", 0))
            .configuration("trap.keepalive.interval = 5\ntrap.maxchunksize = 1024")
            .build()
            .unwrap();

        assert_eq!(client.kind(), EndpointKind::Client);
        assert_eq!(client.trap_id(), ENDPOINT_ID_CLIENT);
        assert_eq!(client.state(), EndpointState::Closed);
        assert_eq!(client.transports().len(), 1);
        assert_eq!(client.settings().keepalive_interval, Some(Duration::from_secs(5)));
        assert_eq!(client.settings().max_chunk_size, 1024);
    }

    #[tokio::test]
    async fn test_default_registry_brings_builtin_transports() {
        let client = ClientBuilder::new().build().unwrap();
        let names: Vec<String> = client.transports().iter().map(|t| t.name().to_string()).collect();
        assert!(names.iter().any(|n| n == "loopback"));
    }

    #[tokio::test]
    async fn test_peer_gets_own_id() {
        let a = PeerBuilder::new().registry(TransportRegistry::new()).build().unwrap();
        let b = PeerBuilder::new().registry(TransportRegistry::new()).build().unwrap();
        assert_eq!(a.kind(), EndpointKind::Peer);
        assert_ne!(a.trap_id(), b.trap_id());
    }
}
