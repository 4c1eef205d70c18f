//! Peer endpoint
//!
//! Two peers are symmetric: each listens and each connects. They negotiate
//! over an application-supplied side channel, exchanging their client
//! configurations in OPEN, PING and PONG control messages, and connect to
//! whatever transports the other side offers. Transports that come in
//! through the peer's own listener join the same session.
//!
//! Control messages are regular-format frames on channel 0 with increasing
//! message ids; a control message whose id is not newer than the last one
//! received is dropped. When a transport has no link of its own it can
//! route through the side channel in a TRANSPORT control message.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use trap_core::{codec, Configuration, Message, Operation};
use trap_transport::{TransportHandle, TransportState};

use crate::builder::PeerBuilder;
use crate::delegate::Delegates;
use crate::endpoint::{open_body, Endpoint, EndpointInner, EndpointKind, Role};
use crate::error::{Result, TrapError};
use crate::listener::ListenerEndpoint;
use crate::state::EndpointState;

/// Configuration key naming the peer that sent a configuration
pub const PEER_ID_SENDER: &str = "trap.peer_id_sender";

/// The remote configuration did not say who sent it
pub const ERR_NO_ID: u8 = 1;
/// The remote claims our own id
pub const ERR_DUPLICATE_ID: u8 = 2;
/// The remote's id changed mid-session
pub const ERR_WRONG_ID: u8 = 3;
/// None of our transports could reach the remote
pub const ERR_TRANSPORTS_FAILED: u8 = 4;

/// Out-of-band path between two peers, supplied by the application
pub trait SideChannel: Send + Sync {
    fn send_to_remote(&self, data: Bytes);
}

fn remove(list: &mut Vec<TransportHandle>, transport: &TransportHandle) {
    list.retain(|t| t.id() != transport.id());
}

pub(crate) struct PeerRole {
    me: Weak<PeerRole>,
    listener: ListenerEndpoint,
    side: RwLock<Option<Arc<dyn SideChannel>>>,
    connectors: Vec<TransportHandle>,
    active: Mutex<Vec<TransportHandle>>,
    remote_id: Mutex<Option<String>>,
    remote_config: Mutex<Option<String>>,
    local_seq: AtomicU32,
    remote_seq: Mutex<u32>,
}

impl PeerRole {
    pub(crate) fn new(listener: ListenerEndpoint, connectors: Vec<TransportHandle>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listener,
            side: RwLock::new(None),
            connectors,
            active: Mutex::new(Vec::new()),
            remote_id: Mutex::new(None),
            remote_config: Mutex::new(None),
            local_seq: AtomicU32::new(0),
            remote_seq: Mutex::new(0),
        })
    }

    // ========================================================================
    // Control messages
    // ========================================================================

    fn send_control(&self, message: Message) {
        let Some(side) = self.side.read().clone() else {
            debug!("no side channel yet, dropping {}", message.op());
            return;
        };

        let id = self.local_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = message.with_channel(0).with_message_id(id).with_compressed(true);
        match codec::encode(&message) {
            Ok(bytes) => side.send_to_remote(bytes),
            Err(e) => warn!("could not encode {}: {}", message.op(), e),
        }
    }

    fn send_config(&self, endpoint: &EndpointInner, op: Operation) {
        let mut config = self.listener.client_configuration(None);
        config.set_option(PEER_ID_SENDER, endpoint.trap_id());
        self.send_control(Message::new(op).with_payload(config.to_string()));
    }

    fn send_error(&self, code: u8) {
        self.send_control(Message::new(Operation::Error).with_payload(vec![code]));
    }

    fn receive_control(&self, endpoint: &Arc<EndpointInner>, data: &[u8]) -> Result<()> {
        let (message, _) = codec::decode(data)?
            .ok_or_else(|| TrapError::InvalidArgument("truncated control message".into()))?;

        {
            let mut last = self.remote_seq.lock();
            if message.message_id() <= *last {
                debug!(
                    "[{}] stale control message {} dropped",
                    endpoint.trap_id(),
                    message.message_id()
                );
                return Ok(());
            }
            *last = message.message_id();
        }

        match message.op() {
            Operation::Open | Operation::Ping | Operation::Pong => {
                self.on_config(endpoint, message.op(), message.payload())
            }
            Operation::Transport => self.on_transported(endpoint, &message),
            Operation::Error => {
                let code = message.payload().first().copied().unwrap_or(0);
                warn!("[{}] remote peer reported error {}", endpoint.trap_id(), code);
                if endpoint.state() == EndpointState::Opening {
                    endpoint.set_state(EndpointState::Error);
                }
            }
            op => debug!("[{}] ignoring control {}", endpoint.trap_id(), op),
        }
        Ok(())
    }

    fn check_remote_id(&self, endpoint: &EndpointInner, remote: &Configuration) -> Option<u8> {
        let Some(id) = remote.option(PEER_ID_SENDER) else {
            return Some(ERR_NO_ID);
        };
        if id == endpoint.trap_id() {
            return Some(ERR_DUPLICATE_ID);
        }

        let mut known = self.remote_id.lock();
        match known.as_deref() {
            Some(existing) if existing != id => Some(ERR_WRONG_ID),
            Some(_) => None,
            None => {
                *known = Some(id.to_string());
                None
            }
        }
    }

    fn on_config(&self, endpoint: &Arc<EndpointInner>, op: Operation, payload: &Bytes) {
        let text = String::from_utf8_lossy(payload).into_owned();
        let changed = {
            let mut last = self.remote_config.lock();
            if last.as_deref() == Some(text.as_str()) {
                false
            } else {
                *last = Some(text.clone());
                true
            }
        };

        if changed {
            let remote = Configuration::parse(&text);
            if let Some(code) = self.check_remote_id(endpoint, &remote) {
                warn!("[{}] rejecting remote configuration, error {}", endpoint.trap_id(), code);
                *self.remote_config.lock() = None;
                self.send_error(code);
                return;
            }

            let mut config = endpoint.configuration();
            for (key, value) in remote.iter().filter(|(key, _)| *key != PEER_ID_SENDER) {
                config.set_option(key, value);
            }
            endpoint.apply_configuration(config);
        }

        if op == Operation::Ping {
            self.send_config(endpoint, Operation::Pong);
        }
        let state = endpoint.state();
        if state.is_shut() {
            return;
        }
        if op != Operation::Pong || matches!(state, EndpointState::Opening | EndpointState::Sleeping) {
            self.reconnect_transports(endpoint);
        }
    }

    fn on_transported(&self, endpoint: &EndpointInner, message: &Message) {
        let Some(name) = message.auth_data() else {
            warn!("[{}] TRANSPORT without a transport name", endpoint.trap_id());
            return;
        };
        let inner = match codec::decode(message.payload()) {
            Ok(Some((inner, _))) => inner,
            Ok(None) => {
                warn!("[{}] truncated transported message", endpoint.trap_id());
                return;
            }
            Err(e) => {
                warn!("[{}] bad transported message: {}", endpoint.trap_id(), e);
                return;
            }
        };

        let target = self
            .connectors
            .iter()
            .cloned()
            .chain(endpoint.transports_snapshot())
            .find(|t| t.name() == name);
        match target {
            Some(transport) => transport.receive_transported(inner),
            None => debug!("[{}] no transport named {}", endpoint.trap_id(), name),
        }
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Connect every enabled connector that has no link
    fn reconnect_transports(&self, endpoint: &Arc<EndpointInner>) {
        let mut connectors = self.connectors.clone();
        connectors.sort_by_key(|t| t.priority());

        for transport in connectors {
            if !transport.can_connect() || !transport.is_enabled() || !transport.state().is_closed() {
                continue;
            }
            endpoint.add_transport(&transport);
            endpoint.attach(&transport);
            self.active.lock().push(transport.clone());

            if let Err(e) = transport.connect() {
                debug!(
                    "[{}] {} cannot reach the remote: {}",
                    endpoint.trap_id(),
                    transport.name(),
                    e
                );
                remove(&mut self.active.lock(), &transport);
            }
        }
    }
}

#[async_trait]
impl Role for PeerRole {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Peer
    }

    fn transport_state_changed(
        &self,
        endpoint: &Arc<EndpointInner>,
        new_state: TransportState,
        old_state: TransportState,
        transport: &TransportHandle,
    ) {
        if matches!(
            new_state,
            TransportState::Disconnecting | TransportState::Disconnected | TransportState::Error
        ) {
            remove(&mut self.active.lock(), transport);
        }

        let state = endpoint.state();
        if state.is_shut() {
            return;
        }

        match new_state {
            TransportState::Connected if old_state == TransportState::Connecting => {
                let message = open_body(endpoint, None, None)
                    .to_message()
                    .with_format(endpoint.format());
                if let Err(e) = transport.send(&message, false) {
                    warn!("[{}] could not send OPEN: {}", endpoint.trap_id(), e);
                    transport.force_error();
                }
            }
            TransportState::Disconnected | TransportState::Error => {
                let idle = self.active.lock().is_empty() && !endpoint.has_available();
                if !idle {
                    return;
                }
                match state {
                    EndpointState::Opening => {
                        warn!("[{}] no transport reached the remote", endpoint.trap_id());
                        self.send_error(ERR_TRANSPORTS_FAILED);
                        endpoint.set_state(EndpointState::Error);
                    }
                    EndpointState::Open => {
                        info!("[{}] lost every transport, asking the remote", endpoint.trap_id());
                        endpoint.set_state(EndpointState::Sleeping);
                        self.send_config(endpoint, Operation::Ping);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    async fn reconnect(&self, endpoint: &Arc<EndpointInner>, timeout: Duration) -> Result<()> {
        self.send_config(endpoint, Operation::Ping);
        endpoint
            .wait_until(|state| state != EndpointState::Sleeping, timeout)
            .await;
        if endpoint.state() != EndpointState::Open {
            endpoint.set_state(EndpointState::Closed);
        }
        Ok(())
    }

    fn endpoint_state_changed(
        &self,
        _endpoint: &Arc<EndpointInner>,
        new_state: EndpointState,
        _old_state: EndpointState,
    ) {
        if matches!(new_state, EndpointState::Closed | EndpointState::Error) {
            self.listener.close();
        }
    }

    fn need_transport(&self, endpoint: &Arc<EndpointInner>, message: Message, transport: &TransportHandle) {
        let encoded = match codec::encode(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("[{}] could not encode for the side channel: {}", endpoint.trap_id(), e);
                return;
            }
        };
        match Message::new(Operation::Transport)
            .with_payload(encoded)
            .with_auth_data(Some(transport.name().to_string()))
        {
            Ok(wrapped) => self.send_control(wrapped),
            Err(e) => warn!("[{}] transport name unusable: {}", endpoint.trap_id(), e),
        }
    }

    fn transport_adopted(&self, _endpoint: &Arc<EndpointInner>, transport: &TransportHandle) {
        let mut active = self.active.lock();
        if !active.iter().any(|t| t.id() == transport.id()) {
            active.push(transport.clone());
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// One side of a symmetric peer session.
///
/// Derefs to [`Endpoint`] for everything peers share with other kinds.
#[derive(Clone)]
pub struct PeerEndpoint {
    endpoint: Endpoint,
    role: Arc<PeerRole>,
}

impl PeerEndpoint {
    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    pub(crate) fn from_parts(endpoint: Endpoint, role: Arc<PeerRole>) -> Self {
        Self { endpoint, role }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn listener(&self) -> &ListenerEndpoint {
        &self.role.listener
    }

    /// Start listening and announce ourselves over `side`. Everything the
    /// remote sends back on its side channel must be passed to
    /// [`PeerEndpoint::receive`].
    pub fn open(&self, side: Arc<dyn SideChannel>) -> Result<()> {
        let inner = &self.endpoint.inner;
        let state = inner.state();
        if !matches!(state, EndpointState::Closed | EndpointState::Error) {
            return Err(TrapError::InvalidState(state));
        }

        match self.role.listener.listen(Delegates::new()) {
            Ok(()) => {}
            Err(TrapError::NoTransports) if !self.role.connectors.is_empty() => {
                debug!("[{}] nothing to listen on, connecting only", inner.trap_id());
            }
            Err(e) => return Err(e),
        }
        *self.role.side.write() = Some(side);
        inner.set_state(EndpointState::Opening);
        self.role.send_config(inner, Operation::Open);
        if self.role.remote_config.lock().is_some() {
            self.role.reconnect_transports(inner);
        }
        inner.restart_keepalive();
        Ok(())
    }

    /// Hand over bytes that arrived on the side channel
    pub fn receive(&self, data: &[u8]) -> Result<()> {
        self.role.receive_control(&self.endpoint.inner, data)
    }

    /// Id the remote peer announced, once known
    pub fn remote_id(&self) -> Option<String> {
        self.role.remote_id.lock().clone()
    }

    /// Enable a transport on both the connecting and the listening side
    pub fn enable_transport(&self, name: &str) -> Result<()> {
        let mut found = self.role.listener.enable_listener(name).is_ok();
        for transport in self.role.connectors.iter().filter(|t| t.name() == name) {
            transport.enable();
            found = true;
        }
        if !found {
            return Err(TrapError::UnknownTransport(name.to_string()));
        }
        if matches!(self.state(), EndpointState::Open | EndpointState::Sleeping) {
            self.role.reconnect_transports(&self.endpoint.inner);
        }
        Ok(())
    }

    /// Disable a transport on both sides and take its links down
    pub fn disable_transport(&self, name: &str) -> Result<()> {
        let mut found = self.role.listener.disable_listener(name).is_ok();
        for transport in self
            .role
            .connectors
            .iter()
            .cloned()
            .chain(self.endpoint.transports())
            .filter(|t| t.name() == name)
        {
            transport.disable();
            found = true;
        }
        if !found {
            return Err(TrapError::UnknownTransport(name.to_string()));
        }
        Ok(())
    }
}

impl Deref for PeerEndpoint {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.endpoint, f)
    }
}
