//! Peer Tests (trap)
//!
//! Two peers negotiating over an in-memory side channel and meeting on the
//! loopback transport.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use trap::prelude::*;
use trap_test_utils::{init_tracing, wait_until, Collector, DEFAULT_TIMEOUT};
use trap_transport::loopback::LOOPBACK_NAME;
use trap_transport::{ListenerTransport, LoopbackListener, LoopbackTransport, TransportHandle};

fn loopback_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register_connector(LOOPBACK_NAME, || -> TransportHandle { LoopbackTransport::new() });
    registry.register_listener(LOOPBACK_NAME, || -> Arc<dyn ListenerTransport> {
        LoopbackListener::new()
    });
    registry
}

struct Pipe(mpsc::UnboundedSender<Bytes>);

impl SideChannel for Pipe {
    fn send_to_remote(&self, data: Bytes) {
        let _ = self.0.send(data);
    }
}

/// Forward everything written into the returned side channel to `peer`
fn side_channel_to(peer: &PeerEndpoint) -> Arc<dyn SideChannel> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let peer = peer.clone();
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = peer.receive(&data) {
                tracing::warn!("side channel message rejected: {}", e);
            }
        }
    });
    Arc::new(Pipe(tx))
}

fn peer(received: &Collector<Bytes>) -> PeerEndpoint {
    let sink = received.clone();
    PeerEndpoint::builder()
        .registry(loopback_registry())
        .delegates(Delegates::new().on_data(move |data, _, _| sink.push(data)))
        .build()
        .expect("peer build failed")
}

struct Pair {
    a: PeerEndpoint,
    b: PeerEndpoint,
    a_received: Collector<Bytes>,
    b_received: Collector<Bytes>,
}

async fn open_pair() -> Pair {
    init_tracing();
    let (a_received, b_received) = (Collector::new(), Collector::new());
    let a = peer(&a_received);
    let b = peer(&b_received);

    a.open(side_channel_to(&b)).unwrap();
    b.open(side_channel_to(&a)).unwrap();

    assert!(a.wait_for_state(EndpointState::Open, DEFAULT_TIMEOUT).await);
    assert!(b.wait_for_state(EndpointState::Open, DEFAULT_TIMEOUT).await);

    Pair {
        a,
        b,
        a_received,
        b_received,
    }
}

#[tokio::test]
async fn test_peers_meet_over_loopback() {
    let pair = open_pair().await;

    assert_eq!(pair.a.remote_id(), Some(pair.b.trap_id()));
    assert_eq!(pair.b.remote_id(), Some(pair.a.trap_id()));
    assert!(!pair.a.available_transports().is_empty());
    assert!(!pair.b.available_transports().is_empty());
}

#[tokio::test]
async fn test_peers_exchange_data() -> anyhow::Result<()> {
    let pair = open_pair().await;

    pair.a.send(&b"from a"[..], 1, false)?;
    pair.b.send(&b"from b"[..], 1, false)?;

    assert!(pair.b_received.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert!(pair.a_received.wait_for_count(1, DEFAULT_TIMEOUT).await);
    assert_eq!(pair.b_received.values()[0], Bytes::from_static(b"from a"));
    assert_eq!(pair.a_received.values()[0], Bytes::from_static(b"from b"));
    Ok(())
}

#[tokio::test]
async fn test_peer_close_reaches_remote() {
    let pair = open_pair().await;

    pair.a.close();

    assert!(pair.a.wait_for_state(EndpointState::Closed, DEFAULT_TIMEOUT).await);
    let b = pair.b.clone();
    assert!(
        wait_until(
            || matches!(b.state(), EndpointState::Closed | EndpointState::Sleeping),
            DEFAULT_TIMEOUT
        )
        .await
    );
}

#[tokio::test]
async fn test_open_twice_rejected() {
    let pair = open_pair().await;
    let again = pair.a.open(side_channel_to(&pair.b));
    assert!(matches!(again, Err(TrapError::InvalidState(EndpointState::Open))));
}
