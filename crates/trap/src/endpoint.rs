//! Endpoint core
//!
//! [`EndpointInner`] is shared by clients, server sessions and peers. It owns
//! the transports and channels of one session, runs the sending loop that
//! moves queued messages onto the best available transport, and drives the
//! endpoint state machine. What differs between the three kinds lives
//! behind the [`Role`] trait.
//!
//! Lock order: `sending` before `schedule` before any channel lock. State
//! callbacks and application delegates are always called with no endpoint
//! lock held.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use trap_core::{
    Configuration, Format, Message, ObjectPayload, Operation, ENDPOINT_ID_CLIENT,
    ENDPOINT_ID_UNDEFINED,
};
use trap_transport::{
    Authentication, NullAuthentication, TransportDelegate, TransportHandle, TransportState,
};

use crate::channel::{Channel, ChannelHost};
use crate::channel_queue::ChannelScheduler;
use crate::delegate::{Delegates, FailedPayload};
use crate::error::{Result, TrapError};
use crate::handshake::{OpenBody, OpenedBody};
use crate::queue::{QueueFactory, QueueType, DEFAULT_BLOCKING_TIMEOUT};
use crate::scheduler::{IdGenerator, Scheduler, Task, TaskHandle};
use crate::settings::EndpointSettings;
use crate::state::EndpointState;

/// How long CLOSING may last before the endpoint gives up on the remote END
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a transport that got OPEN on a shut endpoint may linger
const REJECT_GRACE: Duration = Duration::from_secs(5);

/// Probe timeout for existing transports when a session gains a new one
const ADOPT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// First pause after a pass in which a transport refused a message
const SEND_BACKOFF_MIN: Duration = Duration::from_millis(1);

const SEND_BACKOFF_MAX: Duration = Duration::from_millis(200);

/// Pause before the next sending pass, doubling while transports keep refusing
fn send_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(SEND_BACKOFF_MIN, |d| (d * 2).min(SEND_BACKOFF_MAX))
}

/// The kind of endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Client,
    Server,
    Peer,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Client => f.write_str("client"),
            EndpointKind::Server => f.write_str("server"),
            EndpointKind::Peer => f.write_str("peer"),
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

/// What a client, a server session or a peer adds to the common core
#[async_trait]
pub(crate) trait Role: Send + Sync + 'static {
    fn kind(&self) -> EndpointKind;

    /// Runs after the core has updated its available list
    fn transport_state_changed(
        &self,
        _endpoint: &Arc<EndpointInner>,
        _new_state: TransportState,
        _old_state: TransportState,
        _transport: &TransportHandle,
    ) {
    }

    /// OPENED arrived and the endpoint is now open
    fn opened(&self, _endpoint: &Arc<EndpointInner>, _body: &OpenedBody, _transport: &TransportHandle) {}

    /// Reply to an OPEN received on `transport`
    fn opened_reply(&self, endpoint: &Arc<EndpointInner>, _open: &Message) -> Message {
        OpenedBody {
            endpoint_id: Some(endpoint.trap_id()),
            configuration: None,
        }
        .to_message()
    }

    /// Bring a sleeping endpoint back within `timeout`
    async fn reconnect(&self, endpoint: &Arc<EndpointInner>, timeout: Duration) -> Result<()>;

    /// Whether a failed liveness probe may trigger `reconnect`
    fn reconnects_when_probing(&self) -> bool {
        true
    }

    fn endpoint_state_changed(
        &self,
        _endpoint: &Arc<EndpointInner>,
        _new_state: EndpointState,
        _old_state: EndpointState,
    ) {
    }

    /// A transport asked for another path to its remote side
    fn need_transport(&self, endpoint: &Arc<EndpointInner>, message: Message, transport: &TransportHandle) {
        debug!(
            "[{}] {} needs another path for {}, none available",
            endpoint.trap_id(),
            transport.name(),
            message
        );
    }

    /// A transport accepted by a listener joined this endpoint
    fn transport_adopted(&self, _endpoint: &Arc<EndpointInner>, _transport: &TransportHandle) {}
}

// ============================================================================
// Detached delegate
// ============================================================================

struct Detached;

impl TransportDelegate for Detached {
    fn state_changed(&self, _new: TransportState, _old: TransportState, _t: &TransportHandle) {}
    fn message_received(&self, _message: Message, _t: &TransportHandle) {}
    fn message_sent(&self, _message: &Message, _t: &TransportHandle) {}
    fn messages_failed_sending(&self, _messages: Vec<Message>, _t: &TransportHandle) {}
}

/// Stop a transport from reporting to anyone
pub(crate) fn detach(transport: &TransportHandle) {
    let nobody: Weak<dyn TransportDelegate> = Weak::<Detached>::new();
    transport.set_delegate(nobody);
}

// ============================================================================
// Endpoint core
// ============================================================================

#[derive(Default)]
struct Timers {
    keepalive: Option<TaskHandle>,
    sleep: Option<TaskHandle>,
    close: Option<TaskHandle>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for timer in [self.keepalive.take(), self.sleep.take(), self.close.take()]
            .into_iter()
            .flatten()
        {
            timer.cancel();
        }
    }
}

pub(crate) struct EndpointInner {
    me: Weak<EndpointInner>,
    role: Arc<dyn Role>,
    trap_id: RwLock<String>,
    state: watch::Sender<EndpointState>,

    config: RwLock<Configuration>,
    settings: RwLock<EndpointSettings>,
    format: RwLock<Format>,
    auth: RwLock<Arc<dyn Authentication>>,
    delegates: RwLock<Delegates>,
    async_delivery: AtomicBool,

    transports: Mutex<Vec<TransportHandle>>,
    available: Mutex<Vec<TransportHandle>>,
    max_active: AtomicUsize,

    channels: RwLock<BTreeMap<u8, Arc<Channel>>>,
    queue_factory: RwLock<Arc<dyn QueueFactory>>,
    blocking_timeout: RwLock<Option<Duration>>,

    schedule: Mutex<ChannelScheduler>,
    schedule_dirty: AtomicBool,
    sending: Mutex<bool>,

    timers: Mutex<Timers>,
    reconnect_deadline: Mutex<Option<Instant>>,

    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

impl EndpointInner {
    pub(crate) fn new(
        role: Arc<dyn Role>,
        scheduler: Arc<dyn Scheduler>,
        ids: Arc<dyn IdGenerator>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(EndpointState::Closed);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            role,
            trap_id: RwLock::new(ENDPOINT_ID_UNDEFINED.to_string()),
            state,
            config: RwLock::new(Configuration::new()),
            settings: RwLock::new(EndpointSettings::default()),
            format: RwLock::new(Format::Regular),
            auth: RwLock::new(Arc::new(NullAuthentication)),
            delegates: RwLock::new(Delegates::default()),
            async_delivery: AtomicBool::new(true),
            transports: Mutex::new(Vec::new()),
            available: Mutex::new(Vec::new()),
            max_active: AtomicUsize::new(1),
            channels: RwLock::new(BTreeMap::new()),
            queue_factory: RwLock::new(Arc::new(QueueType::default())),
            blocking_timeout: RwLock::new(Some(DEFAULT_BLOCKING_TIMEOUT)),
            schedule: Mutex::new(ChannelScheduler::new()),
            schedule_dirty: AtomicBool::new(true),
            sending: Mutex::new(false),
            timers: Mutex::new(Timers::default()),
            reconnect_deadline: Mutex::new(None),
            scheduler,
            ids,
        })
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Endpoint {
        Endpoint { inner: self.clone() }
    }

    pub(crate) fn role(&self) -> &Arc<dyn Role> {
        &self.role
    }

    pub(crate) fn trap_id(&self) -> String {
        self.trap_id.read().clone()
    }

    pub(crate) fn set_trap_id(&self, id: impl Into<String>) {
        *self.trap_id.write() = id.into();
    }

    pub(crate) fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub(crate) fn settings(&self) -> EndpointSettings {
        self.settings.read().clone()
    }

    pub(crate) fn configuration(&self) -> Configuration {
        self.config.read().clone()
    }

    pub(crate) fn format(&self) -> Format {
        *self.format.read()
    }

    pub(crate) fn set_format(&self, format: Format) {
        *self.format.write() = format;
        for transport in self.transports_snapshot() {
            transport.set_format(format);
        }
    }

    pub(crate) fn set_compression(&self, enabled: bool) {
        self.settings.write().compression = enabled;
    }

    pub(crate) fn set_max_active(&self, max: usize) {
        self.max_active.store(max, Ordering::SeqCst);
    }

    pub(crate) fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        *self.auth.write() = auth.clone();
        for transport in self.transports_snapshot() {
            transport.set_authentication(auth.clone());
        }
    }

    pub(crate) fn set_queue_factory(&self, factory: Arc<dyn QueueFactory>) {
        *self.queue_factory.write() = factory;
    }

    pub(crate) fn set_blocking_timeout(&self, timeout: Option<Duration>) {
        *self.blocking_timeout.write() = timeout;
        for channel in self.channel_list() {
            channel.set_blocking_timeout(timeout);
        }
    }

    pub(crate) fn reconnect_deadline(&self) -> Option<Instant> {
        *self.reconnect_deadline.lock()
    }

    /// Replace the configuration. Settings only change for keys it names.
    pub(crate) fn apply_configuration(self: &Arc<Self>, config: Configuration) {
        self.settings.write().apply(&config);
        *self.config.write() = config.clone();
        for transport in self.transports_snapshot() {
            transport.configure(&config);
        }
        self.restart_keepalive();
    }

    pub(crate) fn set_option(self: &Arc<Self>, key: &str, value: impl ToString) {
        let mut config = self.configuration();
        config.set_option(key, value);
        self.apply_configuration(config);
    }

    fn delegates(&self) -> Delegates {
        self.delegates.read().clone()
    }

    // ========================================================================
    // State machine
    // ========================================================================

    pub(crate) fn set_state(self: &Arc<Self>, new_state: EndpointState) {
        let mut old_state = new_state;
        let changed = self.state.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            old_state = std::mem::replace(state, new_state);
            true
        });
        if !changed {
            return;
        }

        debug!("[{}] {} -> {}", self.trap_id(), old_state, new_state);

        match new_state {
            EndpointState::Sleeping => self.arm_sleep_deadline(),
            EndpointState::Closing => self.arm_close_timeout(),
            _ => {}
        }
        if old_state == EndpointState::Sleeping {
            if let Some(timer) = self.timers.lock().sleep.take() {
                timer.cancel();
            }
        }

        let endpoint = self.handle();
        let delegates = self.delegates();
        let event = match (old_state, new_state) {
            (EndpointState::Opening, EndpointState::Open) => delegates.open.as_ref(),
            (EndpointState::Closing, EndpointState::Closed) => delegates.close.as_ref(),
            (EndpointState::Open, EndpointState::Sleeping) => delegates.sleep.as_ref(),
            (EndpointState::Sleeping, EndpointState::Open) => delegates.wakeup.as_ref(),
            (_, EndpointState::Error) => delegates.error.as_ref(),
            _ => None,
        };
        if let Some(handler) = event {
            handler(&endpoint);
        }
        if let Some(handler) = &delegates.state_change {
            handler(new_state, old_state, &endpoint);
        }

        if new_state == EndpointState::Error {
            self.disconnect_transports();
        }

        if matches!(new_state, EndpointState::Closed | EndpointState::Error) {
            self.timers.lock().cancel_all();
            let mut lost = Vec::new();
            for channel in self.channel_list() {
                lost.extend(channel.drain());
            }
            self.report_failed(lost);
        }

        self.role.endpoint_state_changed(self, new_state, old_state);
    }

    fn arm_sleep_deadline(self: &Arc<Self>) {
        let timeout = self.settings.read().reconnect_timeout;
        *self.reconnect_deadline.lock() = Some(Instant::now() + timeout);

        let weak = self.me.clone();
        let timer = self.scheduler.execute_after(
            timeout,
            Box::pin(async move {
                if let Some(endpoint) = weak.upgrade() {
                    if endpoint.state() == EndpointState::Sleeping {
                        info!(
                            "[{}] no transport came back within {:?}, closing",
                            endpoint.trap_id(),
                            timeout
                        );
                        endpoint.disconnect_transports();
                        endpoint.set_state(EndpointState::Closed);
                    }
                }
            }),
        );
        if let Some(previous) = self.timers.lock().sleep.replace(timer) {
            previous.cancel();
        }
    }

    fn arm_close_timeout(self: &Arc<Self>) {
        let weak = self.me.clone();
        let timer = self.scheduler.execute_after(
            CLOSE_TIMEOUT,
            Box::pin(async move {
                if let Some(endpoint) = weak.upgrade() {
                    if endpoint.state() == EndpointState::Closing {
                        debug!("[{}] remote END never came", endpoint.trap_id());
                        endpoint.disconnect_transports();
                        endpoint.set_state(EndpointState::Closed);
                    }
                }
            }),
        );
        if let Some(previous) = self.timers.lock().close.replace(timer) {
            previous.cancel();
        }
    }

    /// Wait until `done` holds for the state, or `timeout` passes
    pub(crate) async fn wait_until<F>(&self, done: F, timeout: Duration) -> bool
    where
        F: Fn(EndpointState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| done(*state))).await,
            Ok(Ok(_))
        );
        reached
    }

    // ========================================================================
    // Closing
    // ========================================================================

    pub(crate) fn close(self: &Arc<Self>) {
        match self.state() {
            EndpointState::Sleeping => {
                self.set_state(EndpointState::Closing);
                self.on_end();
                return;
            }
            EndpointState::Closing | EndpointState::Closed => return,
            EndpointState::Error => {
                debug!("[{}] close called in ERROR, nothing to do", self.trap_id());
                return;
            }
            EndpointState::Opening | EndpointState::Open => {}
        }

        self.set_state(EndpointState::Closing);
        if let Err(e) = self.send_message(Message::new(Operation::End)) {
            warn!("[{}] could not queue END: {}", self.trap_id(), e);
            self.set_state(EndpointState::Error);
        }
    }

    fn on_end(self: &Arc<Self>) {
        self.cancel_keepalive();

        if self.state() == EndpointState::Closing {
            self.disconnect_transports();
            self.set_state(EndpointState::Closed);
            return;
        }

        self.set_state(EndpointState::Closing);
        if let Err(e) = self.send_message(Message::new(Operation::End)) {
            debug!("[{}] could not answer END: {}", self.trap_id(), e);
            self.disconnect_transports();
            if self.all_transports_closed() {
                self.set_state(EndpointState::Closed);
            }
        }
    }

    // ========================================================================
    // Transports
    // ========================================================================

    pub(crate) fn transports_snapshot(&self) -> Vec<TransportHandle> {
        self.transports.lock().clone()
    }

    pub(crate) fn available_snapshot(&self) -> Vec<TransportHandle> {
        self.available.lock().clone()
    }

    pub(crate) fn has_available(&self) -> bool {
        !self.available.lock().is_empty()
    }

    fn first_available(&self) -> Option<TransportHandle> {
        self.available.lock().first().cloned()
    }

    pub(crate) fn transport_named(&self, name: &str) -> Result<TransportHandle> {
        self.transports
            .lock()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| TrapError::UnknownTransport(name.to_string()))
    }

    fn all_transports_closed(&self) -> bool {
        self.transports.lock().iter().all(|t| t.state().is_closed())
    }

    /// Point a transport at this endpoint and give it our settings
    pub(crate) fn attach(&self, transport: &TransportHandle) {
        let delegate: Weak<dyn TransportDelegate> = self.me.clone();
        transport.set_delegate(delegate);
        transport.set_authentication(self.auth.read().clone());
        transport.set_format(self.format());
        transport.configure(&self.config.read());
    }

    /// Add a transport. A live transport with the same name stays, a closed
    /// one is replaced.
    pub(crate) fn add_transport(&self, transport: &TransportHandle) -> bool {
        let mut transports = self.transports.lock();
        if transports.iter().any(|t| t.id() == transport.id()) {
            return false;
        }
        transports.retain(|t| t.name() != transport.name() || !t.state().is_closed());
        transports.push(transport.clone());
        drop(transports);

        self.attach(transport);
        true
    }

    pub(crate) fn remove_transport(&self, transport: &TransportHandle) {
        self.transports.lock().retain(|t| t.id() != transport.id());
        self.remove_from_available(transport);
    }

    pub(crate) fn disconnect_transports(&self) {
        for transport in self.transports_snapshot() {
            transport.disconnect();
        }
    }

    fn remove_from_available(&self, transport: &TransportHandle) {
        self.available.lock().retain(|t| t.id() != transport.id());
    }

    pub(crate) fn add_to_available(self: &Arc<Self>, transport: &TransportHandle) {
        let excess = {
            let mut available = self.available.lock();
            if !available.iter().any(|t| t.id() == transport.id()) {
                let at = available
                    .iter()
                    .position(|t| t.priority() > transport.priority())
                    .unwrap_or(available.len());
                available.insert(at, transport.clone());
            }

            match self.max_active.load(Ordering::SeqCst) {
                0 => {
                    let newest = transport.id();
                    let (keep, older): (Vec<_>, Vec<_>) =
                        available.drain(..).partition(|t| t.id() == newest);
                    *available = keep;
                    older
                }
                max if available.len() > max => available.split_off(max),
                _ => Vec::new(),
            }
        };

        for transport in excess {
            debug!(
                "[{}] too many active transports, dropping {}",
                self.trap_id(),
                transport.name()
            );
            self.scheduler
                .execute(Box::pin(async move { transport.disconnect() }));
        }

        if self.state() == EndpointState::Sleeping {
            self.set_state(EndpointState::Open);
        }
        self.kick_sending();
    }

    fn on_transport_state(
        self: &Arc<Self>,
        new_state: TransportState,
        old_state: TransportState,
        transport: &TransportHandle,
    ) {
        trace!(
            "[{}] {} {} -> {}",
            self.trap_id(),
            transport.name(),
            old_state,
            new_state
        );

        if new_state == TransportState::Available {
            self.add_to_available(transport);
        } else {
            self.remove_from_available(transport);
        }

        if new_state.is_closed()
            && self.state() == EndpointState::Closing
            && self.all_transports_closed()
        {
            self.set_state(EndpointState::Closed);
        }

        self.role
            .transport_state_changed(self, new_state, old_state, transport);
    }

    /// Take over a transport a listener accepted, together with the first
    /// message it received
    pub(crate) fn adopt_transport(self: &Arc<Self>, transport: TransportHandle, message: Message) {
        self.add_transport(&transport);

        let others: Vec<TransportHandle> = self
            .available_snapshot()
            .into_iter()
            .filter(|t| t.id() != transport.id())
            .collect();
        if !others.is_empty() {
            self.scheduler.execute(Box::pin(async move {
                for other in others {
                    if !other.is_alive(Duration::ZERO, true, ADOPT_PROBE_TIMEOUT).await {
                        debug!("[{}] did not answer, erroring", other.name());
                        other.force_error();
                    }
                }
            }));
        }

        if transport.is_available() {
            self.add_to_available(&transport);
        }
        self.role.transport_adopted(self, &transport);
        self.route(message, &transport);
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// The channel with this id, created on first use
    pub(crate) fn channel(self: &Arc<Self>, id: u8) -> Arc<Channel> {
        if let Some(channel) = self.channels.read().get(&id) {
            return channel.clone();
        }

        let mut channels = self.channels.write();
        if let Some(channel) = channels.get(&id) {
            return channel.clone();
        }

        let mut queue = self.queue_factory.read().create();
        queue.set_blocking_timeout(*self.blocking_timeout.read());
        let host: Weak<dyn ChannelHost> = self.me.clone();
        let channel = Channel::new(id, host, queue);
        channels.insert(id, channel.clone());
        self.schedule_dirty.store(true, Ordering::SeqCst);
        channel
    }

    fn existing_channel(&self, id: u8) -> Option<Arc<Channel>> {
        self.channels.read().get(&id).cloned()
    }

    fn channel_list(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue a message on its channel, or hand it straight to an object
    /// transport
    pub(crate) fn send_message(self: &Arc<Self>, mut message: Message) -> Result<()> {
        let state = self.state();
        if !state.accepts_messages() && message.op() != Operation::End {
            return Err(TrapError::InvalidState(state));
        }
        message.set_format(self.format());

        if message.object().is_some() {
            if let Some(transport) = self.first_available() {
                if transport.is_object_transport() {
                    match transport.send(&message, false) {
                        Ok(()) => return Ok(()),
                        Err(e) => debug!(
                            "[{}] direct object send failed, queueing: {}",
                            self.trap_id(),
                            e
                        ),
                    }
                }
            }
        }

        match self.channel(message.channel()).send(message) {
            Err(TrapError::ChannelClosed) => Err(TrapError::InvalidState(self.state())),
            other => other,
        }
    }

    pub(crate) fn kick_sending(self: &Arc<Self>) {
        {
            let mut running = self.sending.lock();
            if *running {
                return;
            }
            *running = true;
        }

        let me = self.clone();
        self.scheduler
            .execute(Box::pin(async move { me.run_sending().await }));
    }

    async fn run_sending(self: Arc<Self>) {
        let mut backoff = None;
        loop {
            if self.schedule_dirty.swap(false, Ordering::SeqCst) {
                let channels = self.channel_list();
                self.schedule.lock().rebuild(channels);
            }

            let stalled = self.send_pass();
            self.schedule.lock().rewind();

            {
                let mut running = self.sending.lock();
                let again = self.schedule_dirty.load(Ordering::SeqCst)
                    || (self.schedule.lock().has_pending() && self.first_available().is_some());
                if !again {
                    *running = false;
                    return;
                }
            }

            if stalled {
                let pause = send_backoff(backoff);
                trace!("[{}] transports refusing, next pass in {:?}", self.trap_id(), pause);
                backoff = Some(pause);
                tokio::time::sleep(pause).await;
            } else {
                backoff = None;
            }
        }
    }

    /// One pass over the scheduler. Returns true when a send failed.
    fn send_pass(self: &Arc<Self>) -> bool {
        loop {
            if !self.schedule.lock().has_pending() {
                return false;
            }
            let Some(transport) = self.first_available() else {
                return false;
            };

            let mut exhausted = false;
            let mut failed = false;
            while transport.is_available() {
                let next = self.schedule.lock().pop();
                let Some(message) = next else {
                    exhausted = true;
                    break;
                };
                if !self.send_on(&transport, message) {
                    failed = true;
                    break;
                }
            }

            transport.flush();
            if !transport.is_available() {
                self.remove_from_available(&transport);
            }
            if exhausted || failed {
                return failed;
            }
        }
    }

    fn send_on(self: &Arc<Self>, transport: &TransportHandle, message: Message) -> bool {
        let channel = self.existing_channel(message.channel());

        if message.object().is_some() && !transport.is_object_transport() {
            warn!(
                "[{}] {} cannot carry objects, dropping message {}",
                self.trap_id(),
                transport.name(),
                message.message_id()
            );
            if let Some(channel) = &channel {
                channel.message_sent(&message);
            }
            self.report_failed(vec![message]);
            return true;
        }

        match transport.send(&message, true) {
            Ok(()) => {
                if !transport.core().tracks_transit() {
                    if let Some(channel) = &channel {
                        channel.message_sent(&message);
                    }
                }
                true
            }
            Err(e) => {
                if let Some(channel) = &channel {
                    channel.add_failed_message(message);
                    let lost = channel.rebuild_queue();
                    self.report_failed(lost);
                }
                if e.is_transport_failure() {
                    debug!("[{}] {} busy: {}", self.trap_id(), transport.name(), e);
                } else {
                    warn!("[{}] send on {} failed: {}", self.trap_id(), transport.name(), e);
                    if transport.state() == TransportState::Available {
                        transport.force_error();
                    }
                }
                false
            }
        }
    }

    /// Tell the application about messages that will never go out
    pub(crate) fn report_failed(self: &Arc<Self>, messages: Vec<Message>) {
        let payloads: Vec<FailedPayload> = messages
            .into_iter()
            .filter(|m| m.op().is_data())
            .map(|mut m| match m.take_object() {
                Some(object) => FailedPayload::Object(object),
                None => FailedPayload::Data(m.payload().clone()),
            })
            .collect();
        if payloads.is_empty() {
            return;
        }

        match self.delegates.read().failed_sending.clone() {
            Some(handler) => handler(payloads, &self.handle()),
            None => debug!(
                "[{}] {} messages could not be sent",
                self.trap_id(),
                payloads.len()
            ),
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    fn route(self: &Arc<Self>, message: Message, transport: &TransportHandle) {
        if self.async_delivery.load(Ordering::SeqCst) && message.message_id() != 0 {
            self.channel(message.channel())
                .receive_message(message, Some(transport.clone()));
        } else {
            self.dispatch(message, Some(transport.clone()));
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message, transport: Option<TransportHandle>) {
        match message.op() {
            Operation::Open => match transport {
                Some(transport) => self.on_open(&message, &transport),
                None => debug!("[{}] OPEN without a transport", self.trap_id()),
            },
            Operation::Opened => match transport {
                Some(transport) => self.on_opened(&message, &transport),
                None => debug!("[{}] OPENED without a transport", self.trap_id()),
            },
            Operation::End => self.on_end(),
            Operation::Error => {
                warn!("[{}] remote reported an error", self.trap_id());
                self.set_state(EndpointState::Error);
            }
            Operation::Message | Operation::FragmentStart | Operation::FragmentEnd => {
                self.on_message(message)
            }
            op => trace!("[{}] ignoring {}", self.trap_id(), op),
        }
    }

    fn on_open(self: &Arc<Self>, message: &Message, transport: &TransportHandle) {
        if self.state().is_shut() {
            debug!("[{}] OPEN on a shut endpoint, ending", self.trap_id());
            if let Err(e) = transport.send_transport_specific(Message::new(Operation::End)) {
                debug!("[{}] could not send END: {}", transport.name(), e);
            }
            let lingering = transport.clone();
            self.scheduler.execute_after(
                REJECT_GRACE,
                Box::pin(async move {
                    if !lingering.state().is_closed() {
                        lingering.force_error();
                    }
                }),
            );
            return;
        }

        let reply = self.role.opened_reply(self, message);
        match transport.send_transport_specific(reply) {
            Ok(()) => self.set_state(EndpointState::Open),
            Err(e) => {
                warn!("[{}] could not send OPENED: {}", self.trap_id(), e);
                transport.force_error();
            }
        }
    }

    fn on_opened(self: &Arc<Self>, message: &Message, transport: &TransportHandle) {
        if self.state().is_shut() {
            return;
        }

        let body = OpenedBody::parse(message.payload());
        if self.trap_id() == ENDPOINT_ID_CLIENT {
            if let Some(id) = &body.endpoint_id {
                self.set_trap_id(id.clone());
            }
        }

        self.set_state(EndpointState::Open);
        self.role.opened(self, &body, transport);
    }

    fn on_message(self: &Arc<Self>, mut message: Message) {
        let channel = message.channel();
        let endpoint = self.handle();
        let delegates = self.delegates.read().clone();

        match message.take_object() {
            Some(object) => match &delegates.object {
                Some(handler) => handler(object, channel, &endpoint),
                None => debug!("[{}] no object delegate, dropping object", self.trap_id()),
            },
            None => match &delegates.data {
                Some(handler) => handler(message.payload().clone(), channel, &endpoint),
                None => debug!(
                    "[{}] no data delegate, dropping {} bytes",
                    self.trap_id(),
                    message.payload().len()
                ),
            },
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    pub(crate) fn last_alive(&self) -> Option<Instant> {
        self.transports_snapshot()
            .iter()
            .filter_map(|t| t.last_alive())
            .max()
    }

    pub(crate) async fn is_alive(
        self: &Arc<Self>,
        within: Duration,
        check: bool,
        reconnect: bool,
        timeout: Duration,
    ) -> bool {
        if let Some(last) = self.last_alive() {
            if last.elapsed() <= within {
                return true;
            }
        }
        if !check {
            return false;
        }

        let probes = self
            .available_snapshot()
            .into_iter()
            .map(|t| async move { t.is_alive(within, true, timeout).await });
        if join_all(probes).await.into_iter().any(|alive| alive) {
            return true;
        }

        if !reconnect || !self.role.reconnects_when_probing() || self.state().is_shut() {
            return false;
        }

        info!("[{}] no transport answered, reconnecting", self.trap_id());
        self.set_state(EndpointState::Sleeping);
        match self.role.reconnect(self, timeout).await {
            Ok(()) => self.state() == EndpointState::Open,
            Err(e) => {
                warn!("[{}] reconnect failed: {}", self.trap_id(), e);
                self.set_state(EndpointState::Error);
                false
            }
        }
    }

    pub(crate) fn restart_keepalive(self: &Arc<Self>) {
        self.cancel_keepalive();
        self.schedule_keepalive();
    }

    fn cancel_keepalive(&self) {
        if let Some(timer) = self.timers.lock().keepalive.take() {
            timer.cancel();
        }
    }

    fn schedule_keepalive(self: &Arc<Self>) {
        let Some(interval) = self.settings.read().keepalive_interval else {
            return;
        };

        let weak = self.me.clone();
        let timer = self.scheduler.execute_after(
            interval,
            Box::pin(async move {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.keepalive_tick();
                }
            }),
        );
        self.timers.lock().keepalive = Some(timer);
    }

    fn keepalive_tick(self: &Arc<Self>) {
        if self.state().is_shut() {
            return;
        }
        let settings = self.settings();
        let Some(interval) = settings.keepalive_interval else {
            return;
        };
        let expiry = settings.keepalive_expiry;
        let stale_after = interval + expiry;

        for transport in self.transports_snapshot() {
            if !transport.is_connected() {
                continue;
            }
            let fresh = transport
                .last_alive()
                .map_or(false, |last| last.elapsed() < stale_after);
            if fresh {
                continue;
            }

            self.scheduler.execute(Box::pin(async move {
                if !transport.is_alive(expiry, true, expiry).await {
                    info!("[{}] keepalive expired, disconnecting", transport.name());
                    transport.disconnect();
                }
            }));
        }

        self.schedule_keepalive();
    }
}

// ============================================================================
// Transport callbacks
// ============================================================================

impl TransportDelegate for EndpointInner {
    fn state_changed(
        &self,
        new_state: TransportState,
        old_state: TransportState,
        transport: &TransportHandle,
    ) {
        if let Some(me) = self.me.upgrade() {
            me.on_transport_state(new_state, old_state, transport);
        }
    }

    fn message_received(&self, message: Message, transport: &TransportHandle) {
        if let Some(me) = self.me.upgrade() {
            me.route(message, transport);
        }
    }

    fn message_sent(&self, message: &Message, _transport: &TransportHandle) {
        if let Some(channel) = self.existing_channel(message.channel()) {
            channel.message_sent(message);
        }
    }

    fn messages_failed_sending(&self, messages: Vec<Message>, transport: &TransportHandle) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        debug!(
            "[{}] {} messages failed on {}",
            me.trap_id(),
            messages.len(),
            transport.name()
        );

        let mut touched: BTreeMap<u8, Arc<Channel>> = BTreeMap::new();
        for message in messages {
            if let Some(channel) = me.existing_channel(message.channel()) {
                channel.add_failed_message(message);
                touched.insert(channel.id(), channel);
            }
        }

        let lost: Vec<Message> = touched.values().flat_map(|c| c.rebuild_queue()).collect();
        me.report_failed(lost);
        me.kick_sending();
    }

    fn need_transport(&self, message: Message, transport: &TransportHandle) {
        if let Some(me) = self.me.upgrade() {
            me.role.need_transport(&me, message, transport);
        }
    }
}

impl ChannelHost for EndpointInner {
    fn max_chunk_size(&self) -> usize {
        self.settings.read().max_chunk_size
    }

    fn kick_sending(&self) {
        if let Some(me) = self.me.upgrade() {
            EndpointInner::kick_sending(&me);
        }
    }

    fn schedule_changed(&self) {
        self.schedule_dirty.store(true, Ordering::SeqCst);
        ChannelHost::kick_sending(self);
    }

    fn deliver(&self, message: Message, transport: Option<TransportHandle>) {
        if let Some(me) = self.me.upgrade() {
            me.dispatch(message, transport);
        }
    }

    fn receive_failed(&self, channel: u8, error: TrapError) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        warn!(
            "[{}] channel {} cannot continue: {}, closing",
            me.trap_id(),
            channel,
            error
        );
        me.close();
    }

    fn send_abandoned(&self, messages: Vec<Message>) {
        if let Some(me) = self.me.upgrade() {
            me.report_failed(messages);
        }
    }

    fn spawn(&self, task: Task) {
        self.scheduler.execute(task);
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// A Trap endpoint: one side of a session.
///
/// Cheap to clone; every clone refers to the same session.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        self.inner.role.kind()
    }

    /// Session id. `NEW` on a client until the server assigns one.
    pub fn trap_id(&self) -> String {
        self.inner.trap_id()
    }

    pub fn state(&self) -> EndpointState {
        self.inner.state()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<EndpointState> {
        self.inner.state.subscribe()
    }

    /// Wait until the endpoint reaches `state`, up to `timeout`
    pub async fn wait_for_state(&self, state: EndpointState, timeout: Duration) -> bool {
        self.inner.wait_until(|s| s == state, timeout).await
    }

    /// Set the callbacks. With `replace_all` unset only the slots `delegates`
    /// fills are replaced.
    pub fn set_delegates(&self, delegates: Delegates, replace_all: bool) {
        let mut current = self.inner.delegates.write();
        if replace_all {
            *current = delegates;
        } else {
            current.merge(delegates);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send bytes on `channel`. Compression applies only when enabled on the
    /// endpoint and the session uses the regular format.
    pub fn send(&self, data: impl Into<Bytes>, channel: u8, compress: bool) -> Result<()> {
        let compress = compress
            && self.inner.settings.read().compression
            && self.inner.format() == Format::Regular;
        self.inner.send_message(
            Message::data(data)
                .with_channel(channel)
                .with_compressed(compress),
        )
    }

    /// Send an in-process object. Only object transports can carry it.
    pub fn send_object(&self, object: ObjectPayload, channel: u8) -> Result<()> {
        self.inner
            .send_message(Message::new(Operation::Message).with_object(object).with_channel(channel))
    }

    /// Close the session gracefully
    pub fn close(&self) {
        self.inner.close();
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// The channel with this id, created with the current queue settings on
    /// first use
    pub fn channel(&self, id: u8) -> Arc<Channel> {
        self.inner.channel(id)
    }

    /// Queue type for channels created from now on
    pub fn set_queue_type(&self, queue_type: QueueType) {
        self.inner.set_queue_factory(Arc::new(queue_type));
    }

    pub fn set_queue_factory(&self, factory: Arc<dyn QueueFactory>) {
        self.inner.set_queue_factory(factory);
    }

    /// How long a send on a full blocking queue waits, 30 seconds unless
    /// changed; `None` waits forever
    pub fn set_blocking_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_blocking_timeout(timeout);
    }

    // ========================================================================
    // Transports
    // ========================================================================

    pub fn transports(&self) -> Vec<TransportHandle> {
        self.inner.transports_snapshot()
    }

    /// Transports currently used for sending, best first
    pub fn available_transports(&self) -> Vec<TransportHandle> {
        self.inner.available_snapshot()
    }

    pub fn transport(&self, name: &str) -> Result<TransportHandle> {
        self.inner.transport_named(name)
    }

    /// Add a transport. Returns false when it is already part of this
    /// endpoint.
    pub fn add_transport(&self, transport: TransportHandle) -> bool {
        self.inner.add_transport(&transport)
    }

    pub fn remove_transport(&self, transport: &TransportHandle) {
        self.inner.remove_transport(transport);
    }

    pub fn enable_transport(&self, name: &str) -> Result<()> {
        self.inner.transport_named(name)?.enable();
        Ok(())
    }

    /// Disable a transport and take its link down
    pub fn disable_transport(&self, name: &str) -> Result<()> {
        self.inner.transport_named(name)?.disable();
        Ok(())
    }

    pub fn enable_all_transports(&self) {
        for transport in self.inner.transports_snapshot() {
            transport.enable();
        }
    }

    pub fn disable_all_transports(&self) {
        for transport in self.inner.transports_snapshot() {
            transport.disable();
        }
    }

    /// Limit the transports used at once. Zero keeps only the newest.
    pub fn set_max_active_transports(&self, max: usize) {
        self.inner.set_max_active(max);
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn configuration(&self) -> Configuration {
        self.inner.configuration()
    }

    /// Replace the configuration with the parsed `text`
    pub fn configure(&self, text: &str) {
        self.inner.apply_configuration(Configuration::parse(text));
    }

    pub fn set_option(&self, key: &str, value: impl ToString) {
        self.inner.set_option(key, value);
    }

    pub fn settings(&self) -> EndpointSettings {
        self.inner.settings()
    }

    /// Keepalive interval; `None` turns keepalives off
    pub fn set_keepalive_interval(&self, interval: Option<Duration>) {
        self.inner.settings.write().keepalive_interval = interval;
        self.inner.restart_keepalive();
    }

    pub fn set_keepalive_expiry(&self, expiry: Duration) {
        self.inner.settings.write().keepalive_expiry = expiry;
        for transport in self.inner.transports_snapshot() {
            transport.core().set_keepalive_expiry(expiry);
        }
    }

    pub fn set_reconnect_timeout(&self, timeout: Duration) {
        self.inner.settings.write().reconnect_timeout = timeout;
    }

    pub fn set_compression(&self, enabled: bool) {
        self.inner.set_compression(enabled);
    }

    pub fn format(&self) -> Format {
        self.inner.format()
    }

    pub fn set_format(&self, format: Format) {
        self.inner.set_format(format);
    }

    pub fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        self.inner.set_authentication(auth);
    }

    /// With async delivery on, messages pass through their channel's reorder
    /// buffer and are delivered from a channel task. Off, they are delivered
    /// on the transport's own task as they arrive.
    pub fn set_async(&self, enabled: bool) {
        self.inner.async_delivery.store(enabled, Ordering::SeqCst);
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Most recent traffic on any transport
    pub fn last_alive(&self) -> Option<Instant> {
        self.inner.last_alive()
    }

    /// True when traffic was seen within `within`. Otherwise, with `check`,
    /// probes the available transports; with `reconnect`, tries to bring
    /// the session back when no probe is answered.
    pub async fn is_alive(
        &self,
        within: Duration,
        check: bool,
        reconnect: bool,
        timeout: Duration,
    ) -> bool {
        self.inner.is_alive(within, check, reconnect, timeout).await
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind())
            .field("trap_id", &self.trap_id())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind(), self.trap_id(), self.state())
    }
}

/// OPEN body a connecting client or peer sends on a fresh transport
pub(crate) fn open_body(endpoint: &EndpointInner, token: Option<String>, config_hash: Option<String>) -> OpenBody {
    let settings = endpoint.settings();
    OpenBody {
        endpoint_id: Some(endpoint.trap_id()),
        connection_token: token,
        max_chunk_size: Some(i32::try_from(settings.max_chunk_size).unwrap_or(i32::MAX)),
        compression: Some(settings.compression),
        auto_hostname: endpoint
            .configuration()
            .option(trap_core::OPTION_AUTO_HOSTNAME)
            .map(str::to_string),
        config_hash,
    }
}
