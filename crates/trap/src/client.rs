//! Client endpoint
//!
//! A client connects its transports in priority order, sends OPEN on each
//! one that comes up and becomes OPEN with the first OPENED. When links
//! drop it cycles through the remaining transports, and when all are gone
//! it sleeps and retries until the reconnect timeout runs out. A periodic
//! recovery attempt reconnects transports that failed earlier.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use trap_core::ENDPOINT_ID_CLIENT;
use trap_transport::{TransportHandle, TransportState};

use crate::builder::ClientBuilder;
use crate::endpoint::{detach, open_body, Endpoint, EndpointInner, EndpointKind, Role};
use crate::error::{Result, TrapError};
use crate::handshake::OpenedBody;
use crate::scheduler::TaskHandle;
use crate::state::EndpointState;

/// Delay before a sleeping client retries the whole transport list
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Recovery {
    to_connect: Vec<TransportHandle>,
    active: Vec<TransportHandle>,
    failed: Vec<TransportHandle>,
    running: bool,
}

fn push_unique(list: &mut Vec<TransportHandle>, transport: &TransportHandle) {
    if !list.iter().any(|t| t.id() == transport.id()) {
        list.push(transport.clone());
    }
}

fn remove(list: &mut Vec<TransportHandle>, transport: &TransportHandle) {
    list.retain(|t| t.id() != transport.id());
}

pub(crate) struct ClientRole {
    me: Weak<ClientRole>,
    recovery: Mutex<Recovery>,
    auto_configure: AtomicBool,
    connection_token: OnceLock<String>,
    heartbeat: Mutex<Option<TaskHandle>>,
}

impl ClientRole {
    pub(crate) fn new(auto_configure: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            recovery: Mutex::new(Recovery::default()),
            auto_configure: AtomicBool::new(auto_configure),
            connection_token: OnceLock::new(),
            heartbeat: Mutex::new(None),
        })
    }

    fn token(&self, endpoint: &EndpointInner) -> String {
        self.connection_token
            .get_or_init(|| endpoint.ids.generate())
            .clone()
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Start over with every transport, best priority first
    fn do_open(&self, endpoint: &Arc<EndpointInner>) -> Result<()> {
        let mut transports = endpoint.transports_snapshot();
        if transports.is_empty() {
            warn!("[{}] no transports to open with", endpoint.trap_id());
            endpoint.set_state(EndpointState::Error);
            return Err(TrapError::NoTransports);
        }
        transports.sort_by_key(|t| t.priority());

        {
            let mut recovery = self.recovery.lock();
            recovery.failed.clear();
            recovery.active.clear();
            recovery.to_connect = transports;
        }
        self.kick_recovery(endpoint);
        Ok(())
    }

    fn kick_recovery(&self, endpoint: &Arc<EndpointInner>) {
        {
            let mut recovery = self.recovery.lock();
            if recovery.running {
                return;
            }
            recovery.running = true;
        }

        let Some(role) = self.me.upgrade() else {
            return;
        };
        let weak = Arc::downgrade(endpoint);
        endpoint
            .scheduler
            .execute(Box::pin(async move { role.run_recovery(weak) }));
    }

    fn run_recovery(&self, weak: Weak<EndpointInner>) {
        let Some(endpoint) = weak.upgrade() else {
            self.recovery.lock().running = false;
            return;
        };

        loop {
            let next = {
                let mut recovery = self.recovery.lock();
                let state = endpoint.state();
                if matches!(state, EndpointState::Closing | EndpointState::Closed) {
                    recovery.to_connect.clear();
                }
                if recovery.to_connect.is_empty() {
                    recovery.running = false;
                    let idle = recovery.active.is_empty();
                    drop(recovery);
                    if idle && endpoint.state() == EndpointState::Opening {
                        warn!("[{}] every transport failed to connect", endpoint.trap_id());
                        endpoint.set_state(EndpointState::Error);
                    }
                    return;
                }
                recovery.to_connect.remove(0)
            };

            if !next.can_connect() || !next.is_enabled() {
                debug!("[{}] skipping {}", endpoint.trap_id(), next.name());
                continue;
            }
            if next.is_connected() {
                push_unique(&mut self.recovery.lock().active, &next);
                continue;
            }

            endpoint.attach(&next);
            push_unique(&mut self.recovery.lock().active, &next);

            debug!("[{}] connecting {}", endpoint.trap_id(), next.name());
            if let Err(e) = next.connect() {
                warn!(
                    "[{}] could not connect {}: {}",
                    endpoint.trap_id(),
                    next.name(),
                    e
                );
                next.force_error();
                detach(&next);
                next.disconnect();
                let mut recovery = self.recovery.lock();
                remove(&mut recovery.active, &next);
                push_unique(&mut recovery.failed, &next);
            }
        }
    }

    fn send_open(&self, endpoint: &Arc<EndpointInner>, transport: &TransportHandle) {
        let config_hash = self
            .auto_configure
            .load(Ordering::SeqCst)
            .then(|| endpoint.configuration().digest());
        let message = open_body(endpoint, Some(self.token(endpoint)), config_hash)
            .to_message()
            .with_format(endpoint.format());

        if let Err(e) = transport.send(&message, false) {
            warn!(
                "[{}] could not send OPEN on {}: {}",
                endpoint.trap_id(),
                transport.name(),
                e
            );
            self.cycle_transport(endpoint, transport);
        }
    }

    /// Give up on a transport and move on to the next one
    fn cycle_transport(&self, endpoint: &Arc<EndpointInner>, transport: &TransportHandle) {
        info!("[{}] cycling {}", endpoint.trap_id(), transport.name());
        {
            let mut recovery = self.recovery.lock();
            remove(&mut recovery.active, transport);
            push_unique(&mut recovery.failed, transport);
        }
        detach(transport);
        transport.disconnect();

        let (pending, idle) = {
            let recovery = self.recovery.lock();
            (!recovery.to_connect.is_empty(), recovery.active.is_empty())
        };

        if pending {
            self.kick_recovery(endpoint);
            return;
        }
        if !idle {
            return;
        }
        if endpoint.state() == EndpointState::Opening {
            warn!("[{}] out of transports while opening", endpoint.trap_id());
            endpoint.set_state(EndpointState::Error);
            return;
        }
        self.retry_later(endpoint, RETRY_DELAY);
    }

    /// Run `do_open` after `delay` if the endpoint still wants it
    fn retry_later(&self, endpoint: &Arc<EndpointInner>, delay: Duration) {
        let Some(role) = self.me.upgrade() else {
            return;
        };
        let weak = Arc::downgrade(endpoint);
        endpoint.scheduler.execute_after(
            delay,
            Box::pin(async move {
                let Some(endpoint) = weak.upgrade() else {
                    return;
                };
                if !matches!(endpoint.state(), EndpointState::Open | EndpointState::Sleeping) {
                    return;
                }
                if let Err(e) = role.do_open(&endpoint) {
                    debug!("[{}] retry failed: {}", endpoint.trap_id(), e);
                }
            }),
        );
    }

    /// Queue every transport that is neither active nor queued, failed
    /// ones included
    fn make_recovery_attempt(&self, endpoint: &Arc<EndpointInner>) {
        let mut transports = endpoint.transports_snapshot();
        transports.sort_by_key(|t| t.priority());
        {
            let mut recovery = self.recovery.lock();
            recovery.failed.clear();
            for transport in &transports {
                if !recovery.active.iter().any(|t| t.id() == transport.id()) {
                    push_unique(&mut recovery.to_connect, transport);
                }
            }
            recovery.to_connect.sort_by_key(|t| t.priority());
        }
        self.kick_recovery(endpoint);
    }

    fn start_heartbeat(&self, endpoint: &Arc<EndpointInner>) {
        let Some(role) = self.me.upgrade() else {
            return;
        };
        let interval = endpoint.settings().transport_recovery_timeout;
        let weak = Arc::downgrade(endpoint);
        let timer = endpoint.scheduler.execute_after(
            interval,
            Box::pin(async move {
                let Some(endpoint) = weak.upgrade() else {
                    return;
                };
                match endpoint.state() {
                    EndpointState::Open => {
                        debug!("[{}] periodic transport recovery", endpoint.trap_id());
                        role.make_recovery_attempt(&endpoint);
                        role.start_heartbeat(&endpoint);
                    }
                    EndpointState::Opening | EndpointState::Sleeping => {
                        role.start_heartbeat(&endpoint)
                    }
                    _ => {}
                }
            }),
        );
        if let Some(previous) = self.heartbeat.lock().replace(timer) {
            previous.cancel();
        }
    }

    fn active_count(&self) -> usize {
        self.recovery.lock().active.len()
    }

    fn on_link_lost(
        &self,
        endpoint: &Arc<EndpointInner>,
        old_state: TransportState,
        transport: &TransportHandle,
    ) {
        let state = endpoint.state();

        if state == EndpointState::Sleeping
            && endpoint
                .reconnect_deadline()
                .map_or(false, |deadline| Instant::now() >= deadline)
        {
            info!("[{}] reconnect timeout passed, closing", endpoint.trap_id());
            endpoint.set_state(EndpointState::Closed);
            return;
        }

        match old_state {
            TransportState::Available | TransportState::Unavailable | TransportState::Connected => {
                if self.active_count() > 0 {
                    push_unique(&mut self.recovery.lock().to_connect, transport);
                    self.kick_recovery(endpoint);
                } else if state == EndpointState::Opening {
                    push_unique(&mut self.recovery.lock().failed, transport);
                    self.kick_recovery(endpoint);
                } else {
                    let delay = if state == EndpointState::Sleeping {
                        RETRY_DELAY
                    } else {
                        Duration::ZERO
                    };
                    if state == EndpointState::Open {
                        endpoint.set_state(EndpointState::Sleeping);
                    }
                    info!(
                        "[{}] lost {}, reconnecting in {:?}",
                        endpoint.trap_id(),
                        transport.name(),
                        delay
                    );
                    self.retry_later(endpoint, delay);
                }
            }
            TransportState::Connecting => self.cycle_transport(endpoint, transport),
            _ => {
                if matches!(state, EndpointState::Open | EndpointState::Sleeping)
                    && self.active_count() == 0
                {
                    self.cycle_transport(endpoint, transport);
                }
            }
        }

        if endpoint.state() == EndpointState::Open && self.active_count() == 0 {
            endpoint.set_state(EndpointState::Sleeping);
        }
    }
}

#[async_trait]
impl Role for ClientRole {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Client
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
            remove(&mut self.recovery.lock().active, transport);
        }

        if endpoint.state().is_shut() {
            return;
        }

        match new_state {
            TransportState::Disconnected | TransportState::Error => {
                self.on_link_lost(endpoint, old_state, transport)
            }
            TransportState::Connected if old_state == TransportState::Connecting => {
                self.send_open(endpoint, transport)
            }
            _ => {}
        }
    }

    fn opened(&self, endpoint: &Arc<EndpointInner>, body: &OpenedBody, _transport: &TransportHandle) {
        let Some(update) = &body.configuration else {
            return;
        };
        if endpoint.trap_id() == ENDPOINT_ID_CLIENT {
            return;
        }

        info!("[{}] server sent a new configuration", endpoint.trap_id());
        let mut config = endpoint.configuration();
        config.merge(update);
        endpoint.apply_configuration(config);
        self.make_recovery_attempt(endpoint);
    }

    async fn reconnect(&self, endpoint: &Arc<EndpointInner>, timeout: Duration) -> Result<()> {
        let transports = endpoint.transports_snapshot();
        for transport in &transports {
            detach(transport);
            transport.disconnect();
        }

        self.do_open(endpoint)?;

        let budget = timeout * transports.len().max(1) as u32;
        endpoint
            .wait_until(|state| state != EndpointState::Sleeping, budget)
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
            if let Some(timer) = self.heartbeat.lock().take() {
                timer.cancel();
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// An endpoint that connects out to a listener.
///
/// Derefs to [`Endpoint`] for everything clients share with other kinds.
#[derive(Clone)]
pub struct ClientEndpoint {
    endpoint: Endpoint,
    role: Arc<ClientRole>,
}

impl ClientEndpoint {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_parts(endpoint: Endpoint, role: Arc<ClientRole>) -> Self {
        Self { endpoint, role }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Start connecting. Completion is signalled by the open delegate or a
    /// state change to OPEN.
    pub fn open(&self) -> Result<()> {
        let inner = &self.endpoint.inner;
        let state = inner.state();
        if !matches!(state, EndpointState::Closed | EndpointState::Error) {
            return Err(TrapError::InvalidState(state));
        }

        inner.set_state(EndpointState::Opening);
        self.role.do_open(inner)?;
        self.role.start_heartbeat(inner);
        inner.restart_keepalive();
        Ok(())
    }

    /// Open and wait for the session to come up
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.open()?;
        let open = self
            .endpoint
            .inner
            .wait_until(|state| state != EndpointState::Opening, timeout)
            .await;
        match self.state() {
            EndpointState::Open => Ok(()),
            _ if !open => Err(TrapError::Timeout),
            state => Err(TrapError::InvalidState(state)),
        }
    }

    /// Whether OPEN carries a configuration digest so the server can push
    /// an updated configuration
    pub fn set_auto_configure(&self, enabled: bool) {
        self.role.auto_configure.store(enabled, Ordering::SeqCst);
    }

    /// Enable a transport, and connect it right away when the session is up
    pub fn enable_transport(&self, name: &str) -> Result<()> {
        let transport = self.endpoint.transport(name)?;
        transport.enable();
        if matches!(self.state(), EndpointState::Open | EndpointState::Sleeping) {
            push_unique(&mut self.role.recovery.lock().to_connect, &transport);
            self.role.kick_recovery(&self.endpoint.inner);
        }
        Ok(())
    }

    /// Retry every transport that is not currently in use
    pub fn recover_transports(&self) {
        self.role.make_recovery_attempt(&self.endpoint.inner);
    }
}

impl Deref for ClientEndpoint {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl std::fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.endpoint, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trap_core::{Message, Operation};
    use trap_test_utils::{wait_until, MockTransport};
    use trap_transport::TransportRegistry;
    use trap_transport::Transport;

    fn client_with(mocks: &[Arc<MockTransport>]) -> ClientEndpoint {
        let mut builder = ClientBuilder::new().registry(TransportRegistry::new());
        for mock in mocks {
            builder = builder.transport(mock.clone());
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_open_without_transports_errors() {
        let client = client_with(&[]);
        assert!(matches!(client.open(), Err(TrapError::NoTransports)));
        assert_eq!(client.state(), EndpointState::Error);
    }

    #[tokio::test]
    async fn test_open_adopts_assigned_id() {
        let mock = MockTransport::new("mock", 0).replying_opened("session-7");
        let client = client_with(&[mock.clone()]);

        client.connect(Duration::from_secs(2)).await.unwrap();
        assert_eq!(client.trap_id(), "session-7");
        assert_eq!(mock.sent_ops()[0], Operation::Open);
    }

    #[tokio::test]
    async fn test_open_body_carries_token_and_id() {
        let mock = MockTransport::new("mock", 0).replying_opened("s");
        let client = client_with(&[mock.clone()]);
        client.connect(Duration::from_secs(2)).await.unwrap();

        let open = &mock.outbox.values()[0];
        let body = crate::handshake::OpenBody::parse(open.payload());
        assert_eq!(body.endpoint_id.as_deref(), Some(ENDPOINT_ID_CLIENT));
        assert!(body.connection_token.is_some());
        assert!(body.config_hash.is_some());
    }

    #[tokio::test]
    async fn test_failed_connect_moves_to_next_transport() {
        let broken = MockTransport::new("broken", 0);
        broken.set_connect_fails(true);
        let backup = MockTransport::new("backup", 10).replying_opened("s");
        let client = client_with(&[broken.clone(), backup.clone()]);

        client.connect(Duration::from_secs(2)).await.unwrap();
        assert!(backup.is_available());
        assert!(broken.state().is_closed());
    }

    #[tokio::test]
    async fn test_all_transports_failing_errors() {
        let broken = MockTransport::new("broken", 0);
        broken.set_connect_fails(true);
        let client = client_with(&[broken]);

        assert!(client.connect(Duration::from_secs(2)).await.is_err());
        assert_eq!(client.state(), EndpointState::Error);
    }

    #[tokio::test]
    async fn test_lost_link_sleeps_and_reconnects() {
        let mock = MockTransport::new("mock", 0).replying_opened("s");
        let client = client_with(&[mock.clone()]);
        client.connect(Duration::from_secs(2)).await.unwrap();

        mock.drop_link();
        assert_eq!(client.state(), EndpointState::Sleeping);

        assert!(
            client
                .wait_for_state(EndpointState::Open, Duration::from_secs(3))
                .await
        );
        assert!(mock.is_available());
    }

    #[tokio::test]
    async fn test_server_configuration_is_merged() {
        let mock = MockTransport::new("mock", 0);
        let client = client_with(&[mock.clone()]);
        client.open().unwrap();
        assert!(wait_until(|| mock.sent_ops().contains(&Operation::Open), Duration::from_secs(2)).await);

        let body = OpenedBody {
            endpoint_id: Some("abc".into()),
            configuration: Some(trap_core::Configuration::parse("trap.keepalive.interval = 0")),
        };
        mock.inject(body.to_message());
        assert_eq!(client.state(), EndpointState::Open);
        assert_eq!(client.settings().keepalive_interval, None);
        assert_eq!(
            client.configuration().option("trap.keepalive.interval"),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let mock = MockTransport::new("mock", 0).replying_opened("s");
        let client = client_with(&[mock]);
        client.connect(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            client.open(),
            Err(TrapError::InvalidState(EndpointState::Open))
        ));
    }

    #[tokio::test]
    async fn test_close_completes_on_remote_end() {
        let mock = MockTransport::new("mock", 0).replying_opened("s");
        let client = client_with(&[mock.clone()]);
        client.connect(Duration::from_secs(2)).await.unwrap();

        client.close();
        assert_eq!(client.state(), EndpointState::Closing);
        assert!(wait_until(|| mock.sent_ops().contains(&Operation::End), Duration::from_secs(2)).await);

        mock.inject(Message::new(Operation::End));
        assert_eq!(client.state(), EndpointState::Closed);
    }
}
