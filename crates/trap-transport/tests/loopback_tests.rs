//! Loopback transport tests
//!
//! Connect/accept through the process-wide rendezvous table, message
//! hand-over, liveness probing and disconnect propagation.

use std::sync::{Arc, Weak};
use std::time::Duration;
use trap_core::{Message, ObjectPayload, Operation};
use trap_test_utils::{init_tracing, wait_until, Collector, RecordingDelegate, DEFAULT_TIMEOUT};
use trap_transport::{
    ListenerDelegate, ListenerTransport, LoopbackListener, LoopbackTransport, Transport,
    TransportError, TransportHandle, TransportState,
};

struct Acceptor {
    accepted: Collector<TransportHandle>,
    delegate: Arc<RecordingDelegate>,
}

impl ListenerDelegate for Acceptor {
    fn incoming_transport(&self, transport: TransportHandle) {
        transport.set_delegate(self.delegate.weak());
        self.accepted.push(transport);
    }
}

struct Pair {
    _listener: Arc<LoopbackListener>,
    _acceptor: Arc<Acceptor>,
    client: Arc<LoopbackTransport>,
    client_events: Arc<RecordingDelegate>,
    server: TransportHandle,
    server_events: Arc<RecordingDelegate>,
}

fn connected_pair() -> Pair {
    init_tracing();

    let listener = LoopbackListener::new();
    let acceptor = Arc::new(Acceptor {
        accepted: Collector::new(),
        delegate: RecordingDelegate::new(),
    });
    let weak: Weak<dyn ListenerDelegate> = Arc::downgrade(&acceptor) as Weak<Acceptor>;
    listener.listen(weak).unwrap();

    let client = LoopbackTransport::new();
    client.configure(&listener.client_configuration(None));
    let client_events = RecordingDelegate::new();
    client.set_delegate(client_events.weak());
    client.connect().unwrap();

    let server = acceptor.accepted.last().expect("no transport accepted");
    let server_events = acceptor.delegate.clone();

    Pair {
        _listener: listener,
        _acceptor: acceptor,
        client,
        client_events,
        server,
        server_events,
    }
}

async fn open(pair: &Pair) {
    pair.client
        .send_transport_specific(Message::new(Operation::Open))
        .unwrap();
    assert!(wait_until(|| pair.server.is_available(), DEFAULT_TIMEOUT).await);

    pair.server
        .send_transport_specific(Message::new(Operation::Opened))
        .unwrap();
    assert!(wait_until(|| pair.client.is_available(), DEFAULT_TIMEOUT).await);
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_connect_creates_connected_pair() {
    let pair = connected_pair();

    assert_eq!(pair.client.state(), TransportState::Connected);
    assert_eq!(pair.server.state(), TransportState::Connected);
    assert!(pair.client.is_object_transport());
    assert_eq!(pair.client.priority(), -1000);
    assert!(pair.client_events.has_state(TransportState::Connecting));
}

#[tokio::test]
async fn test_connect_without_listener_fails() {
    let client = LoopbackTransport::with_address("nowhere");
    assert!(matches!(
        client.connect(),
        Err(TransportError::ConnectionFailed(_))
    ));
    assert_eq!(client.state(), TransportState::Disconnected);
}

#[tokio::test]
async fn test_connect_without_address_fails() {
    let client = LoopbackTransport::new();
    assert!(matches!(client.connect(), Err(TransportError::NotConfigured(_))));
}

#[tokio::test]
async fn test_open_promotes_both_sides() {
    let pair = connected_pair();
    open(&pair).await;

    assert_eq!(pair.server_events.received.values()[0].op(), Operation::Open);
    assert_eq!(pair.client_events.received.values()[0].op(), Operation::Opened);
}

// ============================================================================
// Sending
// ============================================================================

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let pair = connected_pair();
    open(&pair).await;

    for id in 1..=50u32 {
        let msg = Message::data(id.to_be_bytes().to_vec()).with_message_id(id);
        pair.client.send(&msg, id < 50).unwrap();
    }

    assert!(pair.server_events.received.wait_for_count(51, DEFAULT_TIMEOUT).await);
    let ids: Vec<u32> = pair.server_events.received.values()[1..]
        .iter()
        .map(Message::message_id)
        .collect();
    assert_eq!(ids, (1..=50).collect::<Vec<_>>());

    // Hand-over counts as sent; nothing waits for acknowledgement
    assert_eq!(pair.client.core().in_transit(), 0);
    assert_eq!(pair.client_events.sent.count(), 0);
}

#[tokio::test]
async fn test_objects_survive_the_hand_over() {
    let pair = connected_pair();
    open(&pair).await;

    let object: ObjectPayload = Arc::new(String::from("not serialized"));
    pair.client
        .send(&Message::data(Vec::new()).with_message_id(1).with_object(object), false)
        .unwrap();

    assert!(pair.server_events.received.wait_for_count(2, DEFAULT_TIMEOUT).await);
    let received = pair.server_events.received.last().unwrap();
    let text = received
        .object()
        .and_then(|o| o.downcast_ref::<String>())
        .cloned();
    assert_eq!(text.as_deref(), Some("not serialized"));
}

#[tokio::test]
async fn test_send_requires_link() {
    let client = LoopbackTransport::new();
    let result = client.send(&Message::data(b"x".as_slice()).with_message_id(1), false);
    assert!(matches!(
        result,
        Err(TransportError::InvalidState(TransportState::Disconnected))
    ));
    assert!(result.unwrap_err().is_transport_failure());
}

// ============================================================================
// Liveness
// ============================================================================

#[tokio::test]
async fn test_ping_probe_gets_pong() {
    let pair = connected_pair();
    open(&pair).await;

    assert!(
        pair.client
            .is_alive(Duration::ZERO, true, Duration::from_secs(2))
            .await
    );
    assert!(pair.client.last_alive().is_some());
    // PING and PONG stay inside the transports
    assert_eq!(pair.server_events.received.count(), 1);
}

#[tokio::test]
async fn test_recent_traffic_counts_as_alive() {
    let pair = connected_pair();
    open(&pair).await;

    assert!(
        pair.client
            .is_alive(Duration::from_secs(60), false, Duration::ZERO)
            .await
    );
}

#[tokio::test]
async fn test_probe_fails_without_link() {
    let client = LoopbackTransport::new();
    assert!(
        !client
            .is_alive(Duration::ZERO, true, Duration::from_millis(100))
            .await
    );
}

// ============================================================================
// Disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_closes_both_halves() {
    let pair = connected_pair();
    open(&pair).await;

    pair.client.disconnect();

    assert_eq!(pair.client.state(), TransportState::Disconnected);
    assert!(wait_until(|| pair.server.state() == TransportState::Disconnected, DEFAULT_TIMEOUT).await);
    assert!(pair.client_events.has_state(TransportState::Disconnecting));
}

#[tokio::test]
async fn test_transport_can_reconnect_after_disconnect() {
    let pair = connected_pair();
    pair.client.disconnect();
    assert_eq!(pair.client.state(), TransportState::Disconnected);

    pair.client.connect().unwrap();
    assert_eq!(pair.client.state(), TransportState::Connected);
}

#[tokio::test]
async fn test_closed_listener_refuses() {
    let pair = connected_pair();
    pair._listener.close();

    let again = LoopbackTransport::new();
    again.configure(&pair._listener.client_configuration(None));
    assert!(again.connect().is_err());
}
