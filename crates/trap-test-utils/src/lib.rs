//! Common test helpers and utilities for Trap tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - Tracing setup driven by `RUST_LOG`
//! - Collectors for callback-driven assertions
//! - A recording transport delegate
//! - A scripted in-memory transport

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use trap_core::{Configuration, Message, Operation, ENDPOINT_ID};
use trap_transport::{
    Result as TransportResult, Transport, TransportCore, TransportDelegate, TransportError,
    TransportHandle, TransportState,
};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Tracing
// ============================================================================

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for a synchronous predicate
pub async fn wait_until<F>(check: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    wait_for(|| std::future::ready(check()), DEFAULT_CHECK_INTERVAL, max_wait).await
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_until(|| counter.load(Ordering::SeqCst) >= target, max_wait).await
}

/// Wait for a boolean flag to become true
pub async fn wait_for_flag(flag: &AtomicBool, max_wait: Duration) -> bool {
    wait_until(|| flag.load(Ordering::SeqCst), max_wait).await
}

/// Wait with notification - more efficient than polling
pub async fn wait_with_notify(notify: &Notify, max_wait: Duration) -> bool {
    timeout(max_wait, notify.notified()).await.is_ok()
}

// ============================================================================
// Collectors
// ============================================================================

/// Thread-safe collector for values handed to callbacks
pub struct Collector<T> {
    values: Arc<Mutex<Vec<T>>>,
    count: Arc<AtomicU32>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            count: self.count.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Record a value
    pub fn push(&self, value: T) {
        self.values.lock().push(value);
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Callback that records every value it is called with
    pub fn callback(&self) -> impl Fn(T) + Send + Sync + 'static {
        let collector = self.clone();
        move |value| collector.push(value)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for at least n values to be received
    pub async fn wait_for_count(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.count, n, max_wait).await
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub fn last(&self) -> Option<T> {
        self.values.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.values.lock().clear();
        self.count.store(0, Ordering::SeqCst);
    }
}

impl<T: Clone + Send + 'static> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Recording transport delegate
// ============================================================================

/// Transport delegate that records every callback
#[derive(Default)]
pub struct RecordingDelegate {
    pub states: Collector<(TransportState, TransportState)>,
    pub received: Collector<Message>,
    pub sent: Collector<Message>,
    pub failed: Collector<Message>,
    pub need_transport: Collector<Message>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Weak handle suitable for `Transport::set_delegate`
    pub fn weak(self: &Arc<Self>) -> Weak<dyn TransportDelegate> {
        let weak: Weak<RecordingDelegate> = Arc::downgrade(self);
        weak
    }

    pub fn has_state(&self, state: TransportState) -> bool {
        self.states.values().iter().any(|(new, _)| *new == state)
    }
}

impl TransportDelegate for RecordingDelegate {
    fn state_changed(&self, new: TransportState, old: TransportState, _t: &TransportHandle) {
        self.states.push((new, old));
    }

    fn message_received(&self, message: Message, _t: &TransportHandle) {
        self.received.push(message);
    }

    fn message_sent(&self, message: &Message, _t: &TransportHandle) {
        self.sent.push(message.clone());
    }

    fn messages_failed_sending(&self, messages: Vec<Message>, _t: &TransportHandle) {
        for message in messages {
            self.failed.push(message);
        }
    }

    fn need_transport(&self, message: Message, _t: &TransportHandle) {
        self.need_transport.push(message);
    }
}

// ============================================================================
// Scripted transport
// ============================================================================

/// In-memory transport whose remote side is scripted by the test.
///
/// Every message the endpoint sends is recorded in `outbox`. With
/// `reply_opened` set the mock answers OPEN with OPENED carrying the given
/// endpoint id; PING is always answered with PONG.
pub struct MockTransport {
    core: TransportCore,
    pub outbox: Collector<Message>,
    pub transported: Collector<Message>,
    connect_fails: AtomicBool,
    sends_fail: AtomicBool,
    object: AtomicBool,
    reply_opened: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new(name: &str, priority: i32) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<MockTransport>| {
            let handle: Weak<dyn Transport> = me.clone();
            Self {
                core: TransportCore::new(name, priority, handle).without_transit(),
                outbox: Collector::new(),
                transported: Collector::new(),
                connect_fails: AtomicBool::new(false),
                sends_fail: AtomicBool::new(false),
                object: AtomicBool::new(false),
                reply_opened: Mutex::new(None),
            }
        })
    }

    /// Answer OPEN with OPENED for the given endpoint id
    pub fn replying_opened(self: Arc<Self>, endpoint_id: &str) -> Arc<Self> {
        *self.reply_opened.lock() = Some(endpoint_id.to_string());
        self
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.connect_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_sends_fail(&self, fails: bool) {
        self.sends_fail.store(fails, Ordering::SeqCst);
    }

    pub fn set_object_transport(&self, object: bool) {
        self.object.store(object, Ordering::SeqCst);
    }

    /// Deliver a message as if the remote side had sent it
    pub fn inject(&self, message: Message) {
        self.core.receive(message);
    }

    /// Pretend a server transport was just accepted
    pub fn accept(&self) {
        self.core.set_state(TransportState::Connected);
    }

    /// Drop the link as if the remote went away
    pub fn drop_link(&self) {
        self.core.link_closed();
    }

    /// Data messages recorded so far
    pub fn sent_data(&self) -> Vec<Message> {
        self.outbox
            .values()
            .into_iter()
            .filter(|m| m.op().is_data())
            .collect()
    }

    pub fn sent_ops(&self) -> Vec<Operation> {
        self.outbox.values().iter().map(Message::op).collect()
    }
}

impl Transport for MockTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn can_connect(&self) -> bool {
        true
    }

    fn is_object_transport(&self) -> bool {
        self.object.load(Ordering::SeqCst)
    }

    fn connect(&self) -> TransportResult<()> {
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("scripted failure".into()));
        }
        self.core.begin_connect()?;
        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    fn internal_send(&self, message: &Message, _expect_more: bool) -> TransportResult<()> {
        if self.sends_fail.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted failure".into()));
        }
        self.outbox.push(message.clone());

        match message.op() {
            Operation::Open => {
                let reply = self.reply_opened.lock().clone();
                if let Some(id) = reply {
                    let mut body = Configuration::new();
                    body.set_option(ENDPOINT_ID, id);
                    let opened = Message::new(Operation::Opened).with_payload(body.to_string());
                    let core = self.core.handle();
                    tokio::spawn(async move {
                        if let Some(transport) = core {
                            transport.core().receive(opened);
                        }
                    });
                }
            }
            Operation::Ping => {
                let pong = Message::new(Operation::Pong);
                let core = self.core.handle();
                tokio::spawn(async move {
                    if let Some(transport) = core {
                        transport.core().receive(pong);
                    }
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn internal_disconnect(&self) {
        self.core.link_closed();
    }

    fn receive_transported(&self, message: Message) {
        self.transported.push(message);
    }
}
