//! Session Tests (trap)
//!
//! Client and listener endpoints talking over the in-process loopback
//! transport:
//! - Opening, data in both directions, graceful close
//! - Fragmentation of messages larger than the chunk size
//! - Object payloads
//! - Server sessions sleeping and expiring when the client goes away
//! - Preferring the best transport, and failing over to a backup

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use trap::prelude::*;
use trap_core::OPTION_MAX_CHUNK_SIZE;
use trap_test_utils::{init_tracing, wait_until, Collector, MockTransport, DEFAULT_TIMEOUT};
use trap_transport::loopback::LOOPBACK_NAME;
use trap_transport::{ListenerTransport, LoopbackListener, LoopbackTransport, TransportHandle};

// ============================================================================
// Helpers
// ============================================================================

fn loopback_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register_connector(LOOPBACK_NAME, || -> TransportHandle { LoopbackTransport::new() });
    registry.register_listener(LOOPBACK_NAME, || -> Arc<dyn ListenerTransport> {
        LoopbackListener::new()
    });
    registry
}

struct Server {
    listener: ListenerEndpoint,
    sessions: Collector<Endpoint>,
    received: Collector<(Bytes, u8)>,
    sleeping: Collector<String>,
}

fn start_server(config: &str) -> Server {
    init_tracing();

    let listener = ListenerEndpoint::builder()
        .registry(loopback_registry())
        .configuration(config)
        .build()
        .expect("listener build failed");

    let sessions = Collector::new();
    let received = Collector::new();
    let sleeping = Collector::new();
    let (on_session, on_data, on_sleep) = (sessions.clone(), received.clone(), sleeping.clone());

    listener
        .listen(Delegates::new().on_accept(move |session, _| {
            let on_data = on_data.clone();
            let on_sleep = on_sleep.clone();
            session.set_delegates(
                Delegates::new()
                    .on_data(move |data, channel, _| on_data.push((data, channel)))
                    .on_sleep(move |endpoint| on_sleep.push(endpoint.trap_id())),
                false,
            );
            on_session.push(session);
        }))
        .expect("listen failed");

    Server {
        listener,
        sessions,
        received,
        sleeping,
    }
}

fn client_for(server: &Server, received: &Collector<(Bytes, u8)>) -> ClientBuilder {
    let on_data = received.clone();
    ClientEndpoint::builder()
        .registry(loopback_registry())
        .configuration(&server.listener.client_configuration_text(None))
        .delegates(Delegates::new().on_data(move |data, channel, _| on_data.push((data, channel))))
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_client_opens_session() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();

    client.connect(DEFAULT_TIMEOUT).await.expect("connect failed");

    assert_eq!(client.state(), EndpointState::Open);
    assert!(server.sessions.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let session = &server.sessions.values()[0];
    assert_eq!(session.trap_id(), client.trap_id());
    assert!(server.listener.session(&client.trap_id()).is_some());
}

#[tokio::test]
async fn test_data_flows_both_ways() {
    let server = start_server("");
    let client_received = Collector::new();
    let client = client_for(&server, &client_received).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();

    client.send(&b"to server"[..], 1, false).unwrap();
    assert!(server.received.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(server.received.values()[0], (Bytes::from_static(b"to server"), 1));

    let session = server.sessions.values().remove(0);
    session.send(&b"to client"[..], 3, false).unwrap();
    assert!(client_received.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(client_received.values()[0], (Bytes::from_static(b"to client"), 3));
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();

    for i in 0..50u32 {
        client.send(i.to_be_bytes().to_vec(), 1, false).unwrap();
    }

    assert!(server.received.wait_for_count(50, DEFAULT_TIMEOUT).await);
    let order: Vec<u32> = server
        .received
        .values()
        .iter()
        .map(|(data, _)| u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
        .collect();
    assert_eq!(order, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_close_ends_both_sides() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    assert!(server.sessions.wait_for_count(1, DEFAULT_TIMEOUT).await);

    client.close();

    assert!(client.wait_for_state(EndpointState::Closed, DEFAULT_TIMEOUT).await);
    let listener = server.listener.clone();
    assert!(wait_until(|| listener.sessions().is_empty(), DEFAULT_TIMEOUT).await);
    assert_eq!(server.sessions.values()[0].state(), EndpointState::Closed);
}

#[tokio::test]
async fn test_send_after_close_rejected() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();

    client.close();
    assert!(client.wait_for_state(EndpointState::Closed, DEFAULT_TIMEOUT).await);
    assert!(matches!(
        client.send(&b"late"[..], 1, false),
        Err(TrapError::InvalidState(EndpointState::Closed))
    ));
}

// ============================================================================
// Payloads
// ============================================================================

#[tokio::test]
async fn test_large_message_fragmented_and_reassembled() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new())
        .option(OPTION_MAX_CHUNK_SIZE, 64)
        .build()
        .unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    assert_eq!(client.settings().max_chunk_size, 64);

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client.send(payload.clone(), 2, false).unwrap();
    client.send(&b"after"[..], 2, false).unwrap();

    assert!(server.received.wait_for_count(2, DEFAULT_TIMEOUT).await);
    let received = server.received.values();
    assert_eq!(received[0].0.as_ref(), payload.as_slice());
    assert_eq!(received[1].0.as_ref(), b"after");
}

#[tokio::test]
async fn test_object_reaches_object_delegate() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    assert!(server.sessions.wait_for_count(1, DEFAULT_TIMEOUT).await);

    let objects: Collector<(u32, u8)> = Collector::new();
    let sink = objects.clone();
    server.sessions.values()[0].set_delegates(
        Delegates::new().on_object(move |object, channel, _| {
            if let Some(value) = object.downcast_ref::<u32>() {
                sink.push((*value, channel));
            }
        }),
        false,
    );

    client.send_object(Arc::new(42u32), 4).unwrap();
    assert!(objects.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(objects.values()[0], (42, 4));
}

// ============================================================================
// Transport loss
// ============================================================================

#[tokio::test]
async fn test_server_session_expires_without_client() {
    let server = start_server("trap.reconnect-timeout = 300");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    assert!(server.sessions.wait_for_count(1, DEFAULT_TIMEOUT).await);

    client.disable_transport(LOOPBACK_NAME).unwrap();

    assert!(server.sleeping.wait_for_count(1, DEFAULT_TIMEOUT).await);
    let listener = server.listener.clone();
    assert!(wait_until(|| listener.sessions().is_empty(), DEFAULT_TIMEOUT).await);
    assert_eq!(server.sessions.values()[0].state(), EndpointState::Closed);
}

#[tokio::test]
async fn test_preferred_transport_carries_all_traffic() {
    init_tracing();
    let primary = MockTransport::new("primary", 0).replying_opened("s2");
    let backup = MockTransport::new("backup", 10).replying_opened("s2");

    let client = ClientEndpoint::builder()
        .registry(TransportRegistry::new())
        .transport(primary.clone())
        .transport(backup.clone())
        .build()
        .unwrap();
    client.set_max_active_transports(2);
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    client.recover_transports();

    let both = client.clone();
    assert!(wait_until(|| both.available_transports().len() == 2, DEFAULT_TIMEOUT).await);
    assert_eq!(client.available_transports()[0].name(), "primary");

    for i in 0..10u8 {
        client.send(vec![i], 1, false).unwrap();
    }

    let primary_out = primary.clone();
    assert!(wait_until(|| primary_out.sent_data().len() == 10, DEFAULT_TIMEOUT).await);
    assert!(backup.sent_data().is_empty());
}

#[tokio::test]
async fn test_failover_to_backup_transport() {
    init_tracing();
    let primary = MockTransport::new("primary", 0).replying_opened("s1");
    let backup = MockTransport::new("backup", 10).replying_opened("s1");

    let client = ClientEndpoint::builder()
        .registry(TransportRegistry::new())
        .transport(primary.clone())
        .transport(backup.clone())
        .build()
        .unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();

    primary.set_connect_fails(true);
    primary.drop_link();
    client.send(&b"one"[..], 1, false).unwrap();
    client.send(&b"two"[..], 1, false).unwrap();

    let backup_out = backup.clone();
    assert!(wait_until(|| backup_out.sent_data().len() == 2, DEFAULT_TIMEOUT).await);
    let payloads: Vec<Bytes> = backup.sent_data().iter().map(|m| m.payload().clone()).collect();
    assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    assert!(primary.sent_data().is_empty());
    assert_eq!(client.state(), EndpointState::Open);
    assert_eq!(client.trap_id(), "s1");
}

#[tokio::test]
async fn test_server_close_closes_client() {
    let server = start_server("");
    let client = client_for(&server, &Collector::new()).build().unwrap();
    client.connect(DEFAULT_TIMEOUT).await.unwrap();
    let id = client.trap_id();

    server.listener.session(&id).unwrap().close();

    assert!(client.wait_for_state(EndpointState::Closed, Duration::from_secs(5)).await);
    let listener = server.listener.clone();
    assert!(wait_until(|| listener.session(&id).is_none(), DEFAULT_TIMEOUT).await);
}
