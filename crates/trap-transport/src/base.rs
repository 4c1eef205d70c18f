//! Shared transport state machine
//!
//! [`TransportCore`] holds everything transports have in common. Concrete
//! transports embed one, construct it with a weak handle to themselves, and
//! feed it every decoded frame through [`TransportCore::receive`].

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use trap_core::codec::{self, get_u28_7bit, put_u28_7bit};
use trap_core::{
    Configuration, Format, Message, Operation, OPTION_KEEPALIVE_EXPIRY, TRANSPORT_PREFIX,
};

use crate::auth::{Authentication, NullAuthentication};
use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportDelegate, TransportHandle, TransportId, TransportState};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Acks are flushed at the latest this long after the first one is queued
const ACK_FLUSH_DELAY: Duration = Duration::from_millis(6);

/// Ack bodies are flushed early once they would outgrow this
const ACK_BATCH_BYTES: usize = 640;

/// How long a DISCONNECTING transport may take before it is forced to ERROR
pub const DEFAULT_KEEPALIVE_EXPIRY: Duration = Duration::from_millis(5000);

/// A connecting transport that is not AVAILABLE after this is errored
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct AckBatch {
    body: BytesMut,
    flush_scheduled: bool,
}

/// State and behaviour common to all transports
pub struct TransportCore {
    id: TransportId,
    name: String,
    me: Weak<dyn Transport>,
    state: Mutex<TransportState>,
    priority: AtomicI32,
    enabled: AtomicBool,
    format: Mutex<Format>,
    tracks_transit: bool,
    delegate: RwLock<Option<Weak<dyn TransportDelegate>>>,
    auth: RwLock<Arc<dyn Authentication>>,
    last_challenge: Mutex<Option<Message>>,
    last_alive: Mutex<Option<Instant>>,
    transit: Mutex<VecDeque<Message>>,
    acks: Mutex<AckBatch>,
    probes: Mutex<Vec<oneshot::Sender<()>>>,
    keepalive_expiry: Mutex<Duration>,
    connect_timer: Mutex<Option<AbortHandle>>,
    runtime: Option<Handle>,
}

impl TransportCore {
    /// `me` is the weak self-handle of the owning transport, normally taken
    /// from `Arc::new_cyclic`.
    pub fn new(name: impl Into<String>, priority: i32, me: Weak<dyn Transport>) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            me,
            state: Mutex::new(TransportState::Disconnected),
            priority: AtomicI32::new(priority),
            enabled: AtomicBool::new(true),
            format: Mutex::new(Format::default()),
            tracks_transit: true,
            delegate: RwLock::new(None),
            auth: RwLock::new(Arc::new(NullAuthentication)),
            last_challenge: Mutex::new(None),
            last_alive: Mutex::new(None),
            transit: Mutex::new(VecDeque::new()),
            acks: Mutex::new(AckBatch::default()),
            probes: Mutex::new(Vec::new()),
            keepalive_expiry: Mutex::new(DEFAULT_KEEPALIVE_EXPIRY),
            connect_timer: Mutex::new(None),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Transports that hand messages over synchronously do not wait for
    /// ACKs; whoever sends through them marks messages sent directly.
    pub fn without_transit(mut self) -> Self {
        self.tracks_transit = false;
        self
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracks_transit(&self) -> bool {
        self.tracks_transit
    }

    pub fn handle(&self) -> Option<TransportHandle> {
        self.me.upgrade()
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn format(&self) -> Format {
        *self.format.lock()
    }

    pub fn set_format(&self, format: Format) {
        *self.format.lock() = format;
    }

    pub fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        *self.auth.write() = auth;
    }

    pub fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn delegate(&self) -> Option<Arc<dyn TransportDelegate>> {
        self.delegate.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn last_alive(&self) -> Option<Instant> {
        *self.last_alive.lock()
    }

    pub fn keepalive_expiry(&self) -> Duration {
        *self.keepalive_expiry.lock()
    }

    pub fn set_keepalive_expiry(&self, expiry: Duration) {
        *self.keepalive_expiry.lock() = expiry;
    }

    /// Messages sent but not yet acknowledged
    pub fn in_transit(&self) -> usize {
        self.transit.lock().len()
    }

    /// Apply `trap.transport.<name>.*` and the keepalive expiry
    pub fn configure(&self, config: &Configuration) {
        let prefix = format!("{}.{}", TRANSPORT_PREFIX, self.name);
        self.set_enabled(config.bool_option(&format!("{}.enabled", prefix), self.is_enabled()));
        self.set_priority(config.int_option(&format!("{}.priority", prefix), self.priority()));

        let expiry = config.long_option(
            OPTION_KEEPALIVE_EXPIRY,
            self.keepalive_expiry().as_millis() as i64,
        );
        if expiry > 0 {
            self.set_keepalive_expiry(Duration::from_millis(expiry as u64));
        }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => Some(handle.spawn(future).abort_handle()),
            None => {
                warn!("[{}] no tokio runtime, task dropped", self.name);
                None
            }
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Move to `new_state`, notify the delegate and settle in-transit
    /// messages when the link went away.
    pub fn set_state(&self, new_state: TransportState) {
        let old_state = {
            let mut state = self.state.lock();
            if *state == new_state {
                return;
            }
            std::mem::replace(&mut *state, new_state)
        };

        debug!("[{}#{}] {} -> {}", self.name, self.id, old_state, new_state);

        if matches!(
            new_state,
            TransportState::Available | TransportState::Disconnected | TransportState::Error
        ) {
            if let Some(timer) = self.connect_timer.lock().take() {
                timer.abort();
            }
        }

        let delegate = self.delegate();
        let handle = self.handle();

        if let (Some(delegate), Some(handle)) = (&delegate, &handle) {
            delegate.state_changed(new_state, old_state, handle);
        }

        if matches!(
            new_state,
            TransportState::Disconnected | TransportState::Disconnecting | TransportState::Error
        ) {
            self.probes.lock().clear();
            self.acks.lock().body.clear();

            let failed: Vec<Message> = self.transit.lock().drain(..).collect();
            if failed.is_empty() {
                return;
            }

            debug!(
                "[{}#{}] {} messages in transit failed",
                self.name,
                self.id,
                failed.len()
            );

            if let (Some(delegate), Some(handle)) = (delegate, handle) {
                // Reported from a fresh task: the endpoint may be inside its
                // sending loop on this very thread.
                let report = move || delegate.messages_failed_sending(failed, &handle);
                if self.runtime.is_some() || Handle::try_current().is_ok() {
                    self.spawn(async move { report() });
                } else {
                    report();
                }
            }
        }
    }

    /// Called by concrete transports when the link itself is gone
    pub fn link_closed(&self) {
        if !self.state().is_closed() {
            self.set_state(TransportState::Disconnected);
        }
    }

    /// Enter CONNECTING from a closed state and arm the connection timeout
    pub fn begin_connect(&self) -> Result<()> {
        let state = self.state();
        if !state.is_closed() {
            return Err(TransportError::InvalidState(state));
        }

        *self.last_challenge.lock() = None;
        self.set_state(TransportState::Connecting);

        let me = self.me.clone();
        let timer = self.spawn(async move {
            tokio::time::sleep(CONNECTION_TIMEOUT).await;
            if let Some(transport) = me.upgrade() {
                if matches!(
                    transport.state(),
                    TransportState::Connecting | TransportState::Connected
                ) {
                    warn!("[{}] connection timed out", transport.name());
                    transport.force_error();
                }
            }
        });
        *self.connect_timer.lock() = timer;
        Ok(())
    }

    /// Send CLOSE, close the link and give it the keepalive expiry to finish
    pub fn disconnect(&self) {
        let Some(handle) = self.handle() else {
            return;
        };

        match self.state() {
            TransportState::Disconnected
            | TransportState::Disconnecting
            | TransportState::Error => return,
            TransportState::Connecting => {
                handle.internal_disconnect();
                self.set_state(TransportState::Disconnected);
                return;
            }
            _ => {}
        }

        self.flush_acks();
        if let Err(e) = self.send_transport_specific(Message::new(Operation::Close)) {
            debug!("[{}] could not send CLOSE: {}", self.name, e);
        }

        self.set_state(TransportState::Disconnecting);
        handle.internal_disconnect();

        if self.state() == TransportState::Disconnecting {
            let expiry = self.keepalive_expiry();
            let me = self.me.clone();
            self.spawn(async move {
                tokio::time::sleep(expiry).await;
                if let Some(transport) = me.upgrade() {
                    if transport.state() == TransportState::Disconnecting {
                        warn!("[{}] disconnect did not complete in time", transport.name());
                        transport.core().set_state(TransportState::Error);
                    }
                }
            });
        }
    }

    pub fn force_error(&self) {
        if self.state() == TransportState::Error {
            return;
        }
        self.set_state(TransportState::Error);
        if let Some(handle) = self.handle() {
            handle.internal_disconnect();
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn authenticated(&self, message: &Message) -> Result<Message> {
        let mut message = message.clone();
        if message.op() != Operation::Challenge {
            let challenge = self.last_challenge.lock().clone();
            let response = self
                .auth
                .read()
                .create_response(challenge.as_ref(), &message);
            if response.is_some() {
                message.set_auth_data(response)?;
            }
        }
        Ok(message)
    }

    /// Send an endpoint message and track it until acknowledged
    pub fn send(&self, message: &Message, expect_more: bool) -> Result<()> {
        let state = self.state();
        if !matches!(state, TransportState::Connected | TransportState::Available) {
            return Err(TransportError::InvalidState(state));
        }

        let handle = self.handle().ok_or(TransportError::ConnectionClosed)?;
        let message = self.authenticated(message)?;

        let tracked = self.tracks_transit && message.message_id() != 0;
        if tracked {
            self.transit.lock().push_back(message.clone());
        }

        if let Err(e) = handle.internal_send(&message, expect_more) {
            if tracked {
                let mut transit = self.transit.lock();
                if let Some(pos) = transit.iter().rposition(|m| same_message(m, &message)) {
                    transit.remove(pos);
                }
            }
            return Err(e);
        }

        trace!("[{}] sent {}", self.name, message);
        Ok(())
    }

    /// Send control traffic. Allowed whenever a link exists.
    pub fn send_transport_specific(&self, message: Message) -> Result<()> {
        let state = self.state();
        if !(state.is_connected() || state == TransportState::Disconnecting) {
            return Err(TransportError::InvalidState(state));
        }

        let handle = self.handle().ok_or(TransportError::ConnectionClosed)?;
        let mut message = self.authenticated(&message)?;
        message.set_format(self.format());
        handle.internal_send(&message, false)?;
        handle.flush();
        Ok(())
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Process one incoming frame
    pub fn receive(&self, message: Message) {
        *self.last_alive.lock() = Some(Instant::now());

        let Some(handle) = self.handle() else {
            return;
        };

        if message.op() != Operation::Challenge && !self.auth.read().verify(&message) {
            self.send_challenge(&message);
            return;
        }

        match message.op() {
            Operation::Open | Operation::Opened => {
                if matches!(
                    self.state(),
                    TransportState::Connected | TransportState::Unavailable
                ) {
                    self.set_state(TransportState::Available);
                }
            }
            Operation::Close => {
                handle.internal_disconnect();
                self.link_closed();
                return;
            }
            Operation::Challenge => {
                self.on_challenge(message);
                return;
            }
            Operation::Ack => {
                self.on_ack(&message, &handle);
                return;
            }
            Operation::Ping => {
                let pong = Message::new(Operation::Pong).with_payload(message.payload().clone());
                if let Err(e) = self.send_transport_specific(pong) {
                    debug!("[{}] could not answer PING: {}", self.name, e);
                }
                return;
            }
            Operation::Pong => {
                for probe in self.probes.lock().drain(..) {
                    let _ = probe.send(());
                }
                return;
            }
            _ => {}
        }

        let acknowledge = self.tracks_transit && message.message_id() != 0;
        let (channel, id) = (message.channel(), message.message_id());

        match self.delegate() {
            Some(delegate) => delegate.message_received(message, &handle),
            None => warn!("[{}] no delegate, dropping {}", self.name, message),
        }

        if acknowledge {
            self.acknowledge(channel, id);
        }
    }

    fn send_challenge(&self, rejected: &Message) {
        warn!("[{}] authentication failed for {}", self.name, rejected);

        let payload = codec::encode(rejected).unwrap_or_default();
        let challenge = match Message::new(Operation::Challenge)
            .with_payload(payload)
            .with_auth_data(self.auth.read().challenge())
        {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("[{}] could not build CHALLENGE: {}", self.name, e);
                return;
            }
        };

        if let Err(e) = self.send_transport_specific(challenge) {
            debug!("[{}] could not send CHALLENGE: {}", self.name, e);
        }
    }

    /// Remember the challenge and resend the rejected message with a response
    fn on_challenge(&self, challenge: Message) {
        *self.last_challenge.lock() = Some(challenge.clone());

        let original = match codec::decode(challenge.payload()) {
            Ok(Some((original, _))) => original,
            _ => return,
        };

        let resent = match self.authenticated(&original) {
            Ok(resent) => resent,
            Err(e) => {
                warn!("[{}] could not answer CHALLENGE: {}", self.name, e);
                return;
            }
        };

        if resent.auth_data() == original.auth_data() {
            warn!("[{}] no new credentials for CHALLENGE, giving up", self.name);
            return;
        }

        if let Err(e) = self.send_transport_specific(resent) {
            debug!("[{}] could not resend challenged message: {}", self.name, e);
        }
    }

    fn on_ack(&self, ack: &Message, handle: &TransportHandle) {
        let body = ack.payload();
        let acked: Vec<(Option<u8>, u32)> = match ack.format() {
            Format::Regular => body
                .chunks_exact(5)
                .map(|c| (Some(c[0]), u32::from_be_bytes([c[1], c[2], c[3], c[4]])))
                .collect(),
            Format::SevenBit => body
                .chunks_exact(4)
                .map(|c| (None, get_u28_7bit(c)))
                .collect(),
        };

        let mut sent = Vec::with_capacity(acked.len());
        {
            let mut transit = self.transit.lock();
            for (channel, id) in acked {
                let pos = transit.iter().position(|m| {
                    m.message_id() == id && channel.map_or(true, |c| c == m.channel())
                });
                if let Some(message) = pos.and_then(|pos| transit.remove(pos)) {
                    sent.push(message);
                }
            }
        }

        if sent.is_empty() {
            return;
        }

        if let Some(delegate) = self.delegate() {
            for message in &sent {
                delegate.message_sent(message, handle);
            }
        }
    }

    fn acknowledge(&self, channel: u8, id: u32) {
        let (flush_now, schedule) = {
            let mut acks = self.acks.lock();
            match self.format() {
                Format::Regular => {
                    acks.body.put_u8(channel);
                    acks.body.put_u32(id);
                }
                Format::SevenBit => put_u28_7bit(&mut acks.body, id),
            }

            let flush_now = acks.body.len() + 5 > ACK_BATCH_BYTES;
            let schedule = !flush_now && !acks.flush_scheduled;
            if schedule {
                acks.flush_scheduled = true;
            }
            (flush_now, schedule)
        };

        if flush_now {
            self.flush_acks();
        } else if schedule {
            let me = self.me.clone();
            self.spawn(async move {
                tokio::time::sleep(ACK_FLUSH_DELAY).await;
                if let Some(transport) = me.upgrade() {
                    transport.core().flush_acks();
                }
            });
        }
    }

    /// Send every queued acknowledgement now
    pub fn flush_acks(&self) {
        let body: Bytes = {
            let mut acks = self.acks.lock();
            acks.flush_scheduled = false;
            if acks.body.is_empty() {
                return;
            }
            acks.body.split().freeze()
        };

        let ack = Message::new(Operation::Ack).with_payload(body);
        if let Err(e) = self.send_transport_specific(ack) {
            debug!("[{}] could not send ACK: {}", self.name, e);
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    pub async fn is_alive(&self, within: Duration, check: bool, timeout: Duration) -> bool {
        if let Some(last) = self.last_alive() {
            if last.elapsed() <= within {
                return true;
            }
        }

        if !check || !self.state().is_connected() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        self.probes.lock().push(tx);

        if let Err(e) = self.send_transport_specific(Message::new(Operation::Ping)) {
            debug!("[{}] could not send PING: {}", self.name, e);
            return false;
        }

        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}

fn same_message(a: &Message, b: &Message) -> bool {
    a.message_id() == b.message_id() && a.channel() == b.channel()
}
