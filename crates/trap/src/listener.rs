//! Listener endpoint
//!
//! Owns the listening transports. Every accepted transport waits here until
//! its first message tells which session it belongs to:
//!
//! - OPEN with a known endpoint id rejoins that session
//! - OPEN with the `NEW` id and a connection token seen within the
//!   concurrent connection window joins the session that token created
//! - any other `NEW` OPEN creates a server endpoint and reports it through
//!   the accept delegate
//!
//! Anything else is answered with ERROR and the transport is dropped.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use trap_core::{Configuration, Format, Message, Operation, ENDPOINT_ID_CLIENT, OPTION_AUTO_HOSTNAME};
use trap_transport::{
    Authentication, ListenerDelegate, ListenerTransport, NullAuthentication, TransportDelegate,
    TransportHandle, TransportId, TransportState,
};

use crate::builder::ListenerBuilder;
use crate::delegate::Delegates;
use crate::endpoint::{detach, Endpoint, EndpointInner};
use crate::error::{Result, TrapError};
use crate::handshake::OpenBody;
use crate::queue::{QueueFactory, QueueType, DEFAULT_BLOCKING_TIMEOUT};
use crate::scheduler::{IdGenerator, Scheduler};
use crate::server::ServerRole;
use crate::settings::EndpointSettings;
use crate::state::EndpointState;

/// How long an accepted transport may stay silent before it is dropped
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct ListenerInner {
    me: Weak<ListenerInner>,
    listeners: Vec<Arc<dyn ListenerTransport>>,
    config: RwLock<Configuration>,
    settings: RwLock<EndpointSettings>,
    auth: RwLock<Arc<dyn Authentication>>,
    queue_factory: RwLock<Arc<dyn QueueFactory>>,
    blocking_timeout: RwLock<Option<Duration>>,
    delegates: RwLock<Delegates>,
    state: Mutex<EndpointState>,

    pending: DashMap<TransportId, TransportHandle>,
    sessions: DashMap<String, Endpoint>,
    tokens: DashMap<String, Weak<EndpointInner>>,
    admission: Mutex<()>,
    target: RwLock<Option<Weak<EndpointInner>>>,

    scheduler: Arc<dyn Scheduler>,
    ids: Arc<dyn IdGenerator>,
}

impl ListenerInner {
    pub(crate) fn new(
        listeners: Vec<Arc<dyn ListenerTransport>>,
        scheduler: Arc<dyn Scheduler>,
        ids: Arc<dyn IdGenerator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listeners,
            config: RwLock::new(Configuration::new()),
            settings: RwLock::new(EndpointSettings::default()),
            auth: RwLock::new(Arc::new(NullAuthentication)),
            queue_factory: RwLock::new(Arc::new(QueueType::default())),
            blocking_timeout: RwLock::new(Some(DEFAULT_BLOCKING_TIMEOUT)),
            delegates: RwLock::new(Delegates::default()),
            state: Mutex::new(EndpointState::Closed),
            pending: DashMap::new(),
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            admission: Mutex::new(()),
            target: RwLock::new(None),
            scheduler,
            ids,
        })
    }

    pub(crate) fn configure(&self, config: Configuration) {
        self.settings.write().apply(&config);
        for listener in &self.listeners {
            listener.configure(&config);
        }
        *self.config.write() = config;
    }

    /// Route every accepted transport to one endpoint, whatever it says
    pub(crate) fn set_target(&self, endpoint: &Arc<EndpointInner>) {
        *self.target.write() = Some(Arc::downgrade(endpoint));
    }

    pub(crate) fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        *self.auth.write() = auth;
    }

    pub(crate) fn merge_delegates(&self, delegates: Delegates) {
        self.delegates.write().merge(delegates);
    }

    pub(crate) fn listen(&self, delegates: Delegates) -> Result<()> {
        self.merge_delegates(delegates);

        let delegate: Weak<dyn ListenerDelegate> = self.me.clone();
        let config = self.config.read().clone();
        let mut started = 0;
        for listener in &self.listeners {
            listener.configure(&config);
            if !listener.is_enabled() {
                debug!("listener {} disabled, skipping", listener.name());
                continue;
            }
            listener.listen(delegate.clone())?;
            started += 1;
        }
        if started == 0 {
            return Err(TrapError::NoTransports);
        }

        *self.state.lock() = EndpointState::Open;
        Ok(())
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = EndpointState::Closing;
        for listener in &self.listeners {
            listener.close();
        }
        let pending: Vec<TransportHandle> = self.pending.iter().map(|e| e.value().clone()).collect();
        self.pending.clear();
        for transport in pending {
            detach(&transport);
            transport.disconnect();
        }
        *self.state.lock() = EndpointState::Closed;
    }

    /// What a client needs to reach every enabled listener
    pub(crate) fn client_configuration(&self, hostname: Option<&str>) -> Configuration {
        let mut config = Configuration::new();
        if let Some(host) = hostname {
            config.set_option(OPTION_AUTO_HOSTNAME, host);
        }
        for listener in self.listeners.iter().filter(|l| l.is_enabled()) {
            config.merge(&listener.client_configuration(hostname));
        }
        config
    }

    pub(crate) fn unregister(&self, trap_id: &str) {
        if self.sessions.remove(trap_id).is_some() {
            debug!("session {} removed", trap_id);
        }
        self.tokens
            .retain(|_, endpoint| endpoint.upgrade().map_or(false, |e| e.trap_id() != trap_id));
    }

    // ========================================================================
    // Admission
    // ========================================================================

    fn admit(&self, message: Message, transport: TransportHandle) {
        self.pending.remove(&transport.id());

        let target = self.target.read().as_ref().and_then(Weak::upgrade);
        if let Some(endpoint) = target {
            endpoint.adopt_transport(transport, message);
            return;
        }

        if message.op() != Operation::Open {
            warn!(
                "[{}] first message was {}, not OPEN",
                transport.name(),
                message.op()
            );
            self.reject(&transport);
            return;
        }

        let body = OpenBody::parse(message.payload());
        match body.endpoint_id.as_deref() {
            Some(id) if !id.eq_ignore_ascii_case(ENDPOINT_ID_CLIENT) => {
                let session = self.sessions.get(id).map(|e| e.value().clone());
                match session {
                    Some(endpoint) if !endpoint.state().is_shut() => {
                        debug!("[{}] {} rejoined", id, transport.name());
                        endpoint.inner.adopt_transport(transport, message);
                    }
                    _ => {
                        info!("[{}] unknown session, rejecting {}", id, transport.name());
                        self.reject(&transport);
                    }
                }
            }
            _ => self.create_or_join(body, message, transport),
        }
    }

    fn create_or_join(&self, body: OpenBody, message: Message, transport: TransportHandle) {
        let guard = self.admission.lock();

        if let Some(token) = &body.connection_token {
            let existing = self.tokens.get(token).and_then(|e| e.value().upgrade());
            if let Some(endpoint) = existing {
                drop(guard);
                debug!(
                    "[{}] {} joined through its connection token",
                    endpoint.trap_id(),
                    transport.name()
                );
                endpoint.adopt_transport(transport, message);
                return;
            }
        }

        let endpoint = self.create_session(message.format());
        if let Some(token) = body.connection_token {
            self.remember_token(token, &endpoint.inner);
        }
        drop(guard);

        info!("[{}] new session over {}", endpoint.trap_id(), transport.name());
        let accept = self.delegates.read().accept.clone();
        match (accept, self.me.upgrade()) {
            (Some(handler), Some(me)) => handler(endpoint.clone(), &ListenerEndpoint { inner: me }),
            _ => debug!("[{}] no accept delegate", endpoint.trap_id()),
        }

        endpoint.inner.adopt_transport(transport, message);
    }

    fn create_session(&self, format: Format) -> Endpoint {
        let role = ServerRole::new(self.me.clone());
        let inner = EndpointInner::new(role, self.scheduler.clone(), self.ids.clone());
        inner.apply_configuration(self.config.read().clone());
        inner.set_authentication(self.auth.read().clone());
        inner.set_queue_factory(self.queue_factory.read().clone());
        inner.set_blocking_timeout(*self.blocking_timeout.read());
        inner.set_max_active(usize::MAX);
        inner.set_trap_id(self.ids.generate());
        inner.set_format(format);

        let endpoint = inner.handle();
        inner.set_state(EndpointState::Opening);
        self.sessions.insert(inner.trap_id(), endpoint.clone());
        inner.set_state(EndpointState::Open);
        endpoint
    }

    fn remember_token(&self, token: String, endpoint: &Arc<EndpointInner>) {
        self.tokens.insert(token.clone(), Arc::downgrade(endpoint));

        let window = self.settings.read().connection_window;
        let me = self.me.clone();
        self.scheduler.execute_after(
            window,
            Box::pin(async move {
                if let Some(listener) = me.upgrade() {
                    listener.tokens.remove(&token);
                }
            }),
        );
    }

    fn reject(&self, transport: &TransportHandle) {
        detach(transport);
        if let Err(e) = transport.send_transport_specific(Message::new(Operation::Error)) {
            debug!("[{}] could not send ERROR: {}", transport.name(), e);
        }
        transport.flush();
        transport.disconnect();
    }
}

impl ListenerDelegate for ListenerInner {
    fn incoming_transport(&self, transport: TransportHandle) {
        if *self.state.lock() != EndpointState::Open {
            debug!("[{}] not listening, dropping", transport.name());
            transport.disconnect();
            return;
        }

        let delegate: Weak<dyn TransportDelegate> = self.me.clone();
        transport.set_delegate(delegate);
        transport.set_authentication(self.auth.read().clone());
        transport.configure(&self.config.read());
        self.pending.insert(transport.id(), transport.clone());

        let id = transport.id();
        let me = self.me.clone();
        self.scheduler.execute_after(
            PENDING_TIMEOUT,
            Box::pin(async move {
                let Some(listener) = me.upgrade() else {
                    return;
                };
                if let Some((_, transport)) = listener.pending.remove(&id) {
                    info!("[{}] never said anything, dropping", transport.name());
                    detach(&transport);
                    transport.disconnect();
                }
            }),
        );
    }
}

impl TransportDelegate for ListenerInner {
    fn state_changed(&self, new_state: TransportState, _old: TransportState, transport: &TransportHandle) {
        if new_state.is_closed() {
            self.pending.remove(&transport.id());
        }
    }

    fn message_received(&self, message: Message, transport: &TransportHandle) {
        self.admit(message, transport.clone());
    }

    fn message_sent(&self, _message: &Message, _transport: &TransportHandle) {}

    fn messages_failed_sending(&self, _messages: Vec<Message>, _transport: &TransportHandle) {}
}

// ============================================================================
// Public handle
// ============================================================================

/// Accepts incoming sessions on a set of listening transports
#[derive(Clone)]
pub struct ListenerEndpoint {
    pub(crate) inner: Arc<ListenerInner>,
}

impl ListenerEndpoint {
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }

    pub(crate) fn from_listeners(
        listeners: Vec<Arc<dyn ListenerTransport>>,
        scheduler: Arc<dyn Scheduler>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            inner: ListenerInner::new(listeners, scheduler, ids),
        }
    }

    /// Start accepting. New sessions are reported to the accept delegate.
    pub fn listen(&self, delegates: Delegates) -> Result<()> {
        self.inner.listen(delegates)
    }

    pub fn state(&self) -> EndpointState {
        *self.inner.state.lock()
    }

    /// Stop accepting. Existing sessions carry on.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Configuration a client needs to reach this listener. `hostname`
    /// replaces the advertised host where a transport supports it.
    pub fn client_configuration(&self, hostname: Option<&str>) -> Configuration {
        self.inner.client_configuration(hostname)
    }

    /// Client configuration as text, ready for `ClientBuilder::configuration`
    pub fn client_configuration_text(&self, hostname: Option<&str>) -> String {
        self.client_configuration(hostname).to_string()
    }

    pub fn configuration(&self) -> Configuration {
        self.inner.config.read().clone()
    }

    /// Replace the configuration handed to listeners and new sessions
    pub fn configure(&self, text: &str) {
        self.inner.configure(Configuration::parse(text));
    }

    pub fn set_option(&self, key: &str, value: impl ToString) {
        let mut config = self.configuration();
        config.set_option(key, value);
        self.inner.configure(config);
    }

    pub fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        self.inner.set_authentication(auth);
    }

    /// Queue type of sessions created from now on
    pub fn set_queue_type(&self, queue_type: QueueType) {
        *self.inner.queue_factory.write() = Arc::new(queue_type);
    }

    pub fn set_queue_factory(&self, factory: Arc<dyn QueueFactory>) {
        *self.inner.queue_factory.write() = factory;
    }

    pub fn set_blocking_timeout(&self, timeout: Option<Duration>) {
        *self.inner.blocking_timeout.write() = timeout;
    }

    /// Live sessions
    pub fn sessions(&self) -> Vec<Endpoint> {
        self.inner.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session(&self, trap_id: &str) -> Option<Endpoint> {
        self.inner.sessions.get(trap_id).map(|e| e.value().clone())
    }

    /// Names of the listening transports
    pub fn listener_names(&self) -> Vec<String> {
        self.inner.listeners.iter().map(|l| l.name().to_string()).collect()
    }

    pub fn enable_listener(&self, name: &str) -> Result<()> {
        self.listener(name)?.set_enabled(true);
        Ok(())
    }

    pub fn disable_listener(&self, name: &str) -> Result<()> {
        self.listener(name)?.set_enabled(false);
        Ok(())
    }

    fn listener(&self, name: &str) -> Result<&Arc<dyn ListenerTransport>> {
        self.inner
            .listeners
            .iter()
            .find(|l| l.name() == name)
            .ok_or_else(|| TrapError::UnknownTransport(name.to_string()))
    }
}

impl std::fmt::Debug for ListenerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerEndpoint")
            .field("state", &self.state())
            .field("listeners", &self.listener_names())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TokioScheduler, UuidGenerator};
    use trap_core::{CONNECTION_TOKEN, ENDPOINT_ID};
    use trap_test_utils::{wait_until, Collector, MockTransport};
    use trap_transport::Transport;

    fn listener() -> ListenerEndpoint {
        let inner = ListenerInner::new(
            Vec::new(),
            Arc::new(TokioScheduler::current().unwrap()),
            Arc::new(UuidGenerator),
        );
        *inner.state.lock() = EndpointState::Open;
        ListenerEndpoint { inner }
    }

    fn accepted(listener: &ListenerEndpoint) -> Arc<MockTransport> {
        let mock = MockTransport::new("mock", 0);
        listener.inner.incoming_transport(mock.clone());
        mock.accept();
        mock
    }

    fn open(id: &str, token: Option<&str>) -> Message {
        let mut config = Configuration::new();
        config.set_option(ENDPOINT_ID, id);
        if let Some(token) = token {
            config.set_option(CONNECTION_TOKEN, token);
        }
        Message::new(Operation::Open).with_payload(config.to_string())
    }

    #[tokio::test]
    async fn test_new_client_gets_session() {
        let listener = listener();
        let accepted_ids: Collector<String> = Collector::new();
        let sink = accepted_ids.clone();
        *listener.inner.delegates.write() =
            Delegates::new().on_accept(move |endpoint, _| sink.push(endpoint.trap_id()));

        let mock = accepted(&listener);
        mock.inject(open(ENDPOINT_ID_CLIENT, Some("t1")));

        assert_eq!(accepted_ids.count(), 1);
        let session = listener.session(&accepted_ids.values()[0]).unwrap();
        assert_eq!(session.state(), EndpointState::Open);
        assert_eq!(mock.sent_ops(), vec![Operation::Opened]);
        assert!(listener.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_same_token_joins_session() {
        let listener = listener();
        let first = accepted(&listener);
        let second = accepted(&listener);

        first.inject(open(ENDPOINT_ID_CLIENT, Some("token")));
        second.inject(open(ENDPOINT_ID_CLIENT, Some("token")));

        let sessions = listener.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].transports().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let listener = listener();
        let mock = accepted(&listener);
        mock.inject(open("no-such-session", None));

        assert_eq!(mock.sent_ops(), vec![Operation::Error, Operation::Close]);
        assert!(mock.state().is_closed());
        assert!(listener.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_non_open_first_message_rejected() {
        let listener = listener();
        let mock = accepted(&listener);
        mock.inject(Message::data(&b"hello"[..]));

        assert_eq!(mock.sent_ops()[0], Operation::Error);
        assert!(mock.state().is_closed());
    }

    #[tokio::test]
    async fn test_known_session_rejoins() {
        let listener = listener();
        let first = accepted(&listener);
        first.inject(open(ENDPOINT_ID_CLIENT, None));
        let session = listener.sessions().pop().unwrap();

        let second = accepted(&listener);
        second.inject(open(&session.trap_id(), None));
        assert_eq!(session.transports().len(), 2);
        assert_eq!(second.sent_ops(), vec![Operation::Opened]);
    }

    #[tokio::test]
    async fn test_closed_session_is_unregistered() {
        let listener = listener();
        let mock = accepted(&listener);
        mock.inject(open(ENDPOINT_ID_CLIENT, None));
        let session = listener.sessions().pop().unwrap();

        session.inner.set_state(EndpointState::Closed);
        assert!(listener.session(&session.trap_id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_transport_dropped() {
        let listener = listener();
        let mock = accepted(&listener);
        assert!(wait_until(|| mock.state().is_closed(), PENDING_TIMEOUT * 2).await);
        assert!(listener.inner.pending.is_empty());
    }
}
