//! In-process loopback transport
//!
//! A [`LoopbackListener`] registers under a generated address in a
//! process-wide table. A [`LoopbackTransport`] configured with that address
//! creates its server half on connect and hands it to the listener. The two
//! halves pass [`Message`] values to each other without serializing, so
//! object attachments survive.
//!
//! Each half owns an inbox task that feeds received messages to its core in
//! order.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};
use trap_core::{Configuration, Message, TRANSPORT_PREFIX};
use uuid::Uuid;

use crate::base::TransportCore;
use crate::error::{Result, TransportError};
use crate::traits::{ListenerDelegate, ListenerTransport, Transport, TransportState};

/// Transport name used in configuration keys
pub const LOOPBACK_NAME: &str = "loopback";

/// Lower is preferred; nothing beats an in-process link
pub const LOOPBACK_PRIORITY: i32 = -1000;

static LISTENERS: OnceLock<DashMap<String, Weak<LoopbackListener>>> = OnceLock::new();

fn listeners() -> &'static DashMap<String, Weak<LoopbackListener>> {
    LISTENERS.get_or_init(DashMap::new)
}

fn option_key(key: &str) -> String {
    format!("{}.{}.{}", TRANSPORT_PREFIX, LOOPBACK_NAME, key)
}

/// One half of an in-process link
pub struct LoopbackTransport {
    core: TransportCore,
    me: Weak<LoopbackTransport>,
    address: Mutex<Option<String>>,
    remote: Mutex<Option<Weak<LoopbackTransport>>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<LoopbackTransport>| {
            let handle: Weak<dyn Transport> = me.clone();
            Self {
                core: TransportCore::new(LOOPBACK_NAME, LOOPBACK_PRIORITY, handle).without_transit(),
                me: me.clone(),
                address: Mutex::new(None),
                remote: Mutex::new(None),
                inbox: Mutex::new(None),
            }
        })
    }

    /// Client half targeting the listener at `address`
    pub fn with_address(address: impl Into<String>) -> Arc<Self> {
        let transport = Self::new();
        *transport.address.lock() = Some(address.into());
        transport
    }

    pub fn address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    fn open_inbox(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let me = self.me.clone();
        self.core.spawn(async move {
            while let Some(message) = rx.recv().await {
                match me.upgrade() {
                    Some(transport) => transport.core.receive(message),
                    None => break,
                }
            }
        });
        *self.inbox.lock() = Some(tx);
    }

    fn deliver(&self, message: Message) -> Result<()> {
        match self.inbox.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn remote(&self) -> Option<Arc<LoopbackTransport>> {
        self.remote.lock().as_ref().and_then(Weak::upgrade)
    }

    fn unlink(&self) {
        self.remote.lock().take();
        self.inbox.lock().take();
        self.core.link_closed();
    }
}

impl Transport for LoopbackTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn can_connect(&self) -> bool {
        true
    }

    fn is_object_transport(&self) -> bool {
        true
    }

    fn configure(&self, config: &Configuration) {
        self.core.configure(config);
        if let Some(address) = config.option(&option_key("address")) {
            *self.address.lock() = Some(address.to_string());
        }
    }

    fn connect(&self) -> Result<()> {
        let address = self
            .address()
            .ok_or_else(|| TransportError::NotConfigured(option_key("address")))?;

        let listener = listeners()
            .get(&address)
            .and_then(|entry| entry.value().upgrade())
            .filter(|listener| listener.is_enabled())
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no loopback listener at {}", address))
            })?;

        let me = self.me.upgrade().ok_or(TransportError::ConnectionClosed)?;
        self.core.begin_connect()?;

        let server = LoopbackTransport::new();
        *server.remote.lock() = Some(Arc::downgrade(&me));
        *self.remote.lock() = Some(Arc::downgrade(&server));
        server.open_inbox();
        self.open_inbox();

        if let Err(e) = listener.accept(server.clone()) {
            self.unlink();
            self.core.set_state(TransportState::Error);
            return Err(e);
        }

        debug!("loopback connected to {}", address);
        server.core.set_state(TransportState::Connected);
        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    fn internal_send(&self, message: &Message, _expect_more: bool) -> Result<()> {
        let remote = self.remote().ok_or(TransportError::ConnectionClosed)?;
        remote.deliver(message.clone())
    }

    fn internal_disconnect(&self) {
        let remote = self.remote();
        self.unlink();
        if let Some(remote) = remote {
            remote.unlink();
        }
    }
}

/// Accepts loopback connections under a generated address
pub struct LoopbackListener {
    address: String,
    me: Weak<LoopbackListener>,
    delegate: RwLock<Option<Weak<dyn ListenerDelegate>>>,
    enabled: AtomicBool,
}

impl LoopbackListener {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            address: Uuid::new_v4().to_string(),
            me: me.clone(),
            delegate: RwLock::new(None),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn accept(&self, transport: Arc<LoopbackTransport>) -> Result<()> {
        let delegate = self
            .delegate
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::ConnectionFailed("listener is closed".into()))?;
        delegate.incoming_transport(transport);
        Ok(())
    }
}

impl ListenerTransport for LoopbackListener {
    fn name(&self) -> &str {
        LOOPBACK_NAME
    }

    fn configure(&self, config: &Configuration) {
        self.set_enabled(config.bool_option(&option_key("enabled"), self.is_enabled()));
    }

    fn listen(&self, delegate: Weak<dyn ListenerDelegate>) -> Result<()> {
        *self.delegate.write() = Some(delegate);
        listeners().insert(self.address.clone(), self.me.clone());
        info!("loopback listening at {}", self.address);
        Ok(())
    }

    fn client_configuration(&self, _hostname: Option<&str>) -> Configuration {
        let mut config = Configuration::new();
        config.set_option(option_key("address"), &self.address);
        config
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn close(&self) {
        listeners().remove(&self.address);
        self.delegate.write().take();
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        listeners().remove(&self.address);
    }
}
