//! Multiplexer behaviour over real loopback sockets.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use vicinity_net_bridge::BridgeEventReceiver;
use vicinity_net_mux::{
    ConnectionMultiplexer, IncomingConnectionState, MuxConfig, MuxError, MuxEvent,
    MuxEventReceiver, MuxLifecycle, mux_channel,
};
use vicinity_net_primitives::PeerIdentifier;
use vicinity_test_utils::{BridgeCall, EchoServer, MockBridge, read_exactly};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    mux: ConnectionMultiplexer,
    bridge: Arc<MockBridge>,
    events: MuxEventReceiver,
    _bridge_events: BridgeEventReceiver,
    _router: Option<EchoServer>,
}

async fn harness(config: MuxConfig) -> Harness {
    let router = EchoServer::bind().await.unwrap();
    let mut harness = harness_with_router(router.port(), config);
    harness._router = Some(router);
    harness
}

fn harness_with_router(router_port: u16, config: MuxConfig) -> Harness {
    let (bridge, bridge_events) = MockBridge::new();
    let (tx, events) = mux_channel();
    let mux = ConnectionMultiplexer::new(bridge.clone(), router_port, config, tx);
    Harness { mux, bridge, events, _bridge_events: bridge_events, _router: None }
}

async fn next_event(events: &mut MuxEventReceiver) -> MuxEvent {
    tokio::time::timeout(WAIT, events.recv()).await.expect("timed out").expect("channel closed")
}

async fn local(port: u16) -> TcpStream {
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap()
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let back = tokio::time::timeout(WAIT, read_exactly(stream, payload.len()))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(back, payload);
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_lifecycle() {
    let h = harness(MuxConfig::default()).await;
    let peer = PeerIdentifier::from("alice");

    assert_eq!(h.mux.lifecycle(), MuxLifecycle::Initialized);
    assert_matches!(h.mux.create_peer_listener(&peer, false).await, Err(MuxError::NotStarted));

    let port = h.mux.start().await.unwrap();
    assert_eq!(h.mux.start().await.unwrap(), port);
    assert_eq!(h.mux.native_listener_port(), Some(port));

    h.mux.stop();
    h.mux.stop();
    assert_eq!(h.mux.lifecycle(), MuxLifecycle::Stopped);
    assert_eq!(h.mux.native_listener_port(), None);
    assert_matches!(h.mux.start().await, Err(MuxError::Stopped));
    assert_matches!(h.mux.create_peer_listener(&peer, false).await, Err(MuxError::Stopped));
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
}

#[tokio::test]
async fn test_peer_listener_is_reused() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let alice = PeerIdentifier::from("alice");
    let bob = PeerIdentifier::from("bob");

    let port = h.mux.create_peer_listener(&alice, false).await.unwrap();
    assert_eq!(h.mux.create_peer_listener(&alice, false).await.unwrap(), port);
    assert_ne!(h.mux.create_peer_listener(&bob, false).await.unwrap(), port);
    assert_eq!(h.mux.peer_listener_port(&alice), Some(port));
    // No native session until someone connects.
    assert_eq!(h.bridge.connect_count("alice"), 0);
}

#[tokio::test]
async fn test_outbound_session_relays_to_native() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    let mut stream = local(port).await;
    round_trip(&mut stream, b"hello over the radio").await;

    // A second local connection shares the native session.
    let mut second = local(port).await;
    round_trip(&mut second, b"again").await;
    assert_eq!(h.bridge.connect_count("alice"), 1);
}

#[tokio::test]
async fn test_please_connect_opens_native_session() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");

    h.mux.create_peer_listener(&peer, true).await.unwrap();
    let bridge = h.bridge.clone();
    eventually(move || bridge.has_native_session("alice")).await;
    assert_eq!(h.bridge.connect_count("alice"), 1);
}

#[tokio::test]
async fn test_reconnects_after_native_session_drops() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    let mut first = local(port).await;
    round_trip(&mut first, b"one").await;
    drop(first);

    h.bridge.drop_native_session("alice");
    let mut second = local(port).await;
    round_trip(&mut second, b"two").await;
    assert_eq!(h.bridge.connect_count("alice"), 2);
}

#[tokio::test]
async fn test_connect_on_demand() {
    let mut h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");

    let port = h.mux.connect_on_demand(&peer).await.unwrap();
    assert!(h.bridge.has_native_session("alice"));
    assert_eq!(h.mux.connect_on_demand(&peer).await.unwrap(), port);
    assert_eq!(h.bridge.connect_count("alice"), 1);

    let bob = PeerIdentifier::from("bob");
    h.bridge.fail("connect", "out of range");
    assert_matches!(h.mux.connect_on_demand(&bob).await, Err(MuxError::Bridge(_)));
    assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::FailedConnection { peer_identifier, .. } if peer_identifier == bob
    );
}

#[tokio::test]
async fn test_native_connect_failure_is_reported() {
    let mut h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();
    h.bridge.fail("connect", "peer went away");

    let mut stream = local(port).await;
    assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::FailedConnection { peer_identifier, error }
            if peer_identifier == peer && error.contains("peer went away")
    );
    // The local side is closed without data.
    let mut buf = [0u8; 1];
    let read = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_terminate_outgoing_connection() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();
    let mut stream = local(port).await;
    round_trip(&mut stream, b"ping").await;

    h.mux.terminate_outgoing_connection(&peer, port).await;
    assert_eq!(h.mux.peer_listener_port(&peer), None);
    assert!(h.bridge.calls().contains(&BridgeCall::Disconnect(peer.clone())));
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());

    // Nothing left to close.
    h.bridge.clear_calls();
    h.mux.terminate_outgoing_connection(&peer, port).await;
    assert!(h.bridge.calls().is_empty());
}

#[tokio::test]
async fn test_terminate_outgoing_ignores_other_port() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    h.mux.terminate_outgoing_connection(&peer, port.wrapping_add(1)).await;
    assert_eq!(h.mux.peer_listener_port(&peer), Some(port));
}

#[tokio::test]
async fn test_inbound_session_reaches_router() {
    let mut h = harness(MuxConfig::default()).await;
    let native_port = h.mux.start().await.unwrap();

    let mut native = local(native_port).await;
    let id = assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::IncomingConnectionState { incoming_connection_id, state: IncomingConnectionState::Connected }
            => incoming_connection_id
    );
    round_trip(&mut native, b"from afar").await;
    assert_eq!(h.mux.incoming_connections(), vec![id]);

    drop(native);
    assert_eq!(
        next_event(&mut h.events).await,
        MuxEvent::IncomingConnectionState {
            incoming_connection_id: id,
            state: IncomingConnectionState::Disconnected
        }
    );
    assert!(h.mux.incoming_connections().is_empty());
}

#[tokio::test]
async fn test_terminate_incoming_connection() {
    let mut h = harness(MuxConfig::default()).await;
    let native_port = h.mux.start().await.unwrap();

    let mut native = local(native_port).await;
    let id = assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::IncomingConnectionState { incoming_connection_id, .. } => incoming_connection_id
    );

    h.mux.terminate_incoming_connection(id);
    assert_eq!(
        next_event(&mut h.events).await,
        MuxEvent::IncomingConnectionState {
            incoming_connection_id: id,
            state: IncomingConnectionState::Disconnected
        }
    );
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, tokio::io::AsyncReadExt::read(&mut native, &mut buf))
        .await
        .expect("timed out");
    assert!(matches!(read, Ok(0) | Err(_)));

    // Already gone: no second event.
    h.mux.terminate_incoming_connection(id);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_router_port_unreachable() {
    let closed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let router_port = closed.local_addr().unwrap().port();
    drop(closed);

    let mut h = harness_with_router(router_port, MuxConfig::default());
    let native_port = h.mux.start().await.unwrap();
    let _native = local(native_port).await;

    assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::RouterPortConnectionFailed { router_port: port, .. } if port == router_port
    );
    assert!(h.mux.incoming_connections().is_empty());
}

#[tokio::test]
async fn test_idle_listener_is_recreated() {
    let config = MuxConfig { session_idle_timeout: Duration::from_millis(200), ..Default::default() };
    let mut h = harness(config).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    let mut stream = local(port).await;
    round_trip(&mut stream, b"then silence").await;

    let new_port = assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::ListenerRecreatedAfterFailure { peer_identifier, port_number }
            if peer_identifier == peer => port_number
    );
    assert_ne!(new_port, port);
    assert_eq!(h.mux.peer_listener_port(&peer), Some(new_port));
    assert!(h.bridge.calls().contains(&BridgeCall::Disconnect(peer.clone())));
    // Reported only after the peer was reached again.
    assert!(h.bridge.has_native_session("alice"));

    let mut fresh = local(new_port).await;
    round_trip(&mut fresh, b"back").await;
    assert_eq!(h.bridge.connect_count("alice"), 2);
}

#[tokio::test]
async fn test_idle_listener_reconnect_failure_is_reported() {
    let config = MuxConfig { session_idle_timeout: Duration::from_millis(200), ..Default::default() };
    let mut h = harness(config).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    let mut stream = local(port).await;
    round_trip(&mut stream, b"last words").await;
    h.bridge.fail("connect", "peer walked away");

    assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::FailedConnection { peer_identifier, error }
            if peer_identifier == peer && error.contains("peer walked away")
    );
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_stalled_session_still_idles_out() {
    let config = MuxConfig { session_idle_timeout: Duration::from_millis(200), ..Default::default() };
    let mut h = harness(config).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();

    // Writes far more than the socket buffers hold and never reads the echo back.
    let mut stream = local(port).await;
    let writer = tokio::spawn(async move {
        let chunk = vec![0u8; 1024 * 1024];
        for _ in 0..64 {
            if stream.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    assert_matches!(
        next_event(&mut h.events).await,
        MuxEvent::ListenerRecreatedAfterFailure { peer_identifier, port_number }
            if peer_identifier == peer && port_number != port
    );
    writer.abort();
}

#[tokio::test]
async fn test_stop_closes_peer_listeners() {
    let h = harness(MuxConfig::default()).await;
    h.mux.start().await.unwrap();
    let peer = PeerIdentifier::from("alice");
    let port = h.mux.create_peer_listener(&peer, false).await.unwrap();
    let mut stream = local(port).await;
    round_trip(&mut stream, b"x").await;

    h.mux.stop();
    assert_eq!(h.mux.peer_listener_port(&peer), None);
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, tokio::io::AsyncReadExt::read(&mut stream, &mut buf))
        .await
        .expect("timed out");
    assert!(matches!(read, Ok(0) | Err(_)));
}
