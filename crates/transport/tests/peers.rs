//! Peer notifications flowing from the bridge to the application.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use assert_matches::assert_matches;
use common::{assert_quiet, eventually, harness, harness_with, next_event, next_matching, round_trip};
use vicinity_net_bridge::{BridgeEvent, DiscoveryAdvertisingState, LocalNetworkPeer, NativePeer};
use vicinity_net_peers::{PeerAvailabilityChanged, TrackerConfig};
use vicinity_net_primitives::{
    Generation, LOOPBACK, NetworkStatus, PeerIdentifier, RadioState, TransportKind,
};
use vicinity_test_utils::{BridgeCall, EchoRouter};
use vicinity_transport::{CoordinatorConfig, CoordinatorError, CoordinatorEvent};

fn local_peer(id: &str, port: u16, generation: u8) -> LocalNetworkPeer {
    LocalNetworkPeer {
        peer_identifier: id.into(),
        generation: Some(Generation::new(generation)),
        host_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
        port_number: Some(port),
    }
}

fn availability(event: CoordinatorEvent) -> PeerAvailabilityChanged {
    assert_matches!(event, CoordinatorEvent::PeerAvailabilityChanged(change) => change)
}

#[tokio::test]
async fn test_local_network_notifications_are_deduplicated() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();

    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    let first = availability(next_event(&mut h.events).await);
    assert_eq!(first.peer_identifier.as_str(), "P1");
    assert_eq!(first.transport_kind, TransportKind::LocalNetwork);
    assert!(first.peer_available);
    assert_eq!(first.generation, Some(Generation::new(1)));

    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8081, 1)));
    let moved = availability(next_event(&mut h.events).await);
    assert!(moved.peer_available);
    assert_eq!(moved.new_address_port, Some(true));
    assert_quiet(&mut h.events).await;

    let info = h
        .coordinator
        .get_peer_host_info(&"P1".into(), TransportKind::LocalNetwork)
        .await
        .unwrap();
    assert_eq!(info.host_address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    assert_eq!(info.port_number, 8081);
    assert_eq!(info.suggested_tcp_timeout, Duration::from_secs(5));
}

#[tokio::test]
async fn test_notifications_ignored_while_not_started() {
    let mut h = harness();
    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    assert_quiet(&mut h.events).await;
    assert!(!h.coordinator.is_peer_available("P1", TransportKind::LocalNetwork));
}

#[tokio::test]
async fn test_radio_peer_gets_a_virtual_endpoint() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    let alice = PeerIdentifier::from("alice");

    h.bridge.announce(vec![
        NativePeer::available("alice", TransportKind::RadioBeacon).with_generation(3),
    ]);
    let change = availability(next_event(&mut h.events).await);
    assert_eq!(change.peer_identifier, alice);
    assert!(change.peer_available);
    // Not connected until the application dials in.
    assert_eq!(h.bridge.connect_count("alice"), 0);

    let info = h
        .coordinator
        .get_peer_host_info(&alice, TransportKind::RadioBeacon)
        .await
        .unwrap();
    assert_eq!(info.host_address, LOOPBACK);
    assert_eq!(info.suggested_tcp_timeout, Duration::from_secs(10));
    round_trip(info.port_number, b"over the air").await;
    assert_eq!(h.bridge.connect_count("alice"), 1);

    // Same announcement again: no event.
    h.bridge.announce(vec![
        NativePeer::available("alice", TransportKind::RadioBeacon).with_generation(3),
    ]);
    assert_quiet(&mut h.events).await;

    h.bridge.announce(vec![NativePeer::unavailable("alice", TransportKind::RadioBeacon)]);
    let gone = availability(next_event(&mut h.events).await);
    assert!(!gone.peer_available);
    assert_matches!(
        h.coordinator
            .get_peer_host_info(&alice, TransportKind::RadioBeacon)
            .await,
        Err(CoordinatorError::PeerNotAvailable { .. })
    );
    let port = info.port_number;
    eventually(move || std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_err()).await;
}

#[tokio::test]
async fn test_please_connect_opens_session_on_announcement() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();

    h.bridge.announce(vec![
        NativePeer::available("alice", TransportKind::RadioClassic).with_please_connect(),
    ]);
    availability(next_event(&mut h.events).await);
    let bridge = h.bridge.clone();
    eventually(move || bridge.has_native_session("alice")).await;
}

#[tokio::test]
async fn test_flooded_radio_peers_get_no_listener() {
    let config = CoordinatorConfig {
        tracker: TrackerConfig {
            capacity_per_kind: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = harness_with(config);
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    availability(next_event(&mut h.events).await);

    let flood: Vec<String> = (0..20).map(|i| format!("flood-{i}")).collect();
    h.bridge.announce(
        flood
            .iter()
            .map(|peer| {
                NativePeer::available(peer.as_str(), TransportKind::RadioBeacon)
                    .with_please_connect()
            })
            .collect(),
    );
    for peer in &flood {
        assert_matches!(
            next_event(&mut h.events).await,
            CoordinatorEvent::CacheOverflow { peer_identifier, transport_kind: TransportKind::RadioBeacon }
                if peer_identifier.as_str() == peer.as_str()
        );
    }
    assert_quiet(&mut h.events).await;

    for peer in &flood {
        assert_eq!(h.bridge.connect_count(peer), 0, "{peer} was connected");
        assert!(!h.bridge.has_native_session(peer));
        assert!(!h.coordinator.is_peer_available(peer, TransportKind::RadioBeacon));
    }
    assert!(h.coordinator.is_peer_available("alice", TransportKind::RadioBeacon));
}

#[tokio::test]
async fn test_radio_connect_failure_drops_peer() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    let alice = PeerIdentifier::from("alice");
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    availability(next_event(&mut h.events).await);

    let info = h
        .coordinator
        .get_peer_host_info(&alice, TransportKind::RadioBeacon)
        .await
        .unwrap();
    h.bridge.fail("connect", "out of range");
    let _stream = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, info.port_number))
        .await
        .unwrap();

    let failed = next_matching(&mut h.events, |event| {
        matches!(event, CoordinatorEvent::FailedConnection { .. })
    })
    .await;
    assert_matches!(
        failed,
        CoordinatorEvent::FailedConnection { peer_identifier, transport_kind: Some(TransportKind::RadioBeacon), error }
            if peer_identifier == alice && error.contains("out of range")
    );
    let gone = availability(
        next_matching(&mut h.events, |event| {
            matches!(event, CoordinatorEvent::PeerAvailabilityChanged(_))
        })
        .await,
    );
    assert!(!gone.peer_available);
    assert!(!h.coordinator.is_peer_available("alice", TransportKind::RadioBeacon));
}

#[tokio::test]
async fn test_multipeer_resolves_through_connect() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    let bob = PeerIdentifier::from("bob");

    h.bridge.announce(vec![
        NativePeer::available("bob", TransportKind::MultipeerFramework).with_generation(1),
    ]);
    let change = availability(next_event(&mut h.events).await);
    assert_eq!(change.generation, Some(Generation::new(1)));

    // Older or equal generations are noise.
    h.bridge.announce(vec![
        NativePeer::available("bob", TransportKind::MultipeerFramework).with_generation(1),
    ]);
    assert_quiet(&mut h.events).await;

    let info = h
        .coordinator
        .get_peer_host_info(&bob, TransportKind::MultipeerFramework)
        .await
        .unwrap();
    assert_eq!(info.host_address, LOOPBACK);
    assert!(h.bridge.has_native_session("bob"));
    round_trip(info.port_number, b"multipeer").await;

    h.bridge.announce(vec![NativePeer::unavailable("bob", TransportKind::MultipeerFramework)]);
    assert!(!availability(next_event(&mut h.events).await).peer_available);
}

#[tokio::test]
async fn test_multipeer_connect_failure_reannounces() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    let carol = PeerIdentifier::from("carol");
    h.bridge.announce(vec![
        NativePeer::available("carol", TransportKind::MultipeerFramework).with_generation(4),
    ]);
    availability(next_event(&mut h.events).await);

    h.bridge.fail("connect", "peer busy");
    assert_matches!(
        h.coordinator
            .get_peer_host_info(&carol, TransportKind::MultipeerFramework)
            .await,
        Err(CoordinatorError::Bridge(_))
    );

    let again = availability(
        next_matching(&mut h.events, |event| {
            matches!(event, CoordinatorEvent::PeerAvailabilityChanged(_))
        })
        .await,
    );
    assert!(again.peer_available);
    assert_eq!(again.new_address_port, Some(true));
    assert_eq!(again.generation, Some(Generation::new(4)));
    // Only the one attempt the application asked for.
    assert_eq!(h.bridge.connect_count("carol"), 1);
    assert!(h.coordinator.is_peer_available("carol", TransportKind::MultipeerFramework));
}

#[tokio::test]
async fn test_radio_off_evicts_radio_peers() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    availability(next_event(&mut h.events).await);
    availability(next_event(&mut h.events).await);

    h.bridge.network_changed(NetworkStatus {
        radio_classic: RadioState::Off,
        radio_low_energy: RadioState::Off,
        network: RadioState::On,
        cellular: RadioState::DoNotCare,
        bssid_name: None,
    });

    let gone = loop {
        match next_event(&mut h.events).await {
            CoordinatorEvent::PeerAvailabilityChanged(change) => break change,
            CoordinatorEvent::NetworkChanged(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert!(!gone.peer_available);
    assert_eq!(gone.peer_identifier.as_str(), "alice");
    assert_quiet(&mut h.events).await;
    assert!(h.coordinator.is_peer_available("P1", TransportKind::LocalNetwork));
}

#[tokio::test]
async fn test_discovery_stopped_evicts_native_peers() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.announce(vec![NativePeer::available("bob", TransportKind::MultipeerFramework)]);
    availability(next_event(&mut h.events).await);

    h.bridge.push(BridgeEvent::DiscoveryAdvertisingState(DiscoveryAdvertisingState {
        discovery_active: false,
        advertising_active: true,
    }));
    let gone = availability(
        next_matching(&mut h.events, |event| {
            matches!(event, CoordinatorEvent::PeerAvailabilityChanged(_))
        })
        .await,
    );
    assert_eq!(gone.peer_identifier.as_str(), "bob");
    assert!(!gone.peer_available);
}

#[tokio::test]
async fn test_local_network_discovery_stopped() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    availability(next_event(&mut h.events).await);

    h.bridge.push(BridgeEvent::LocalNetworkDiscoveryStopped);
    let gone = availability(next_event(&mut h.events).await);
    assert_eq!(gone.transport_kind, TransportKind::LocalNetwork);
    assert!(!gone.peer_available);
}

#[tokio::test]
async fn test_stop_evicts_every_peer() {
    let mut h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.push(BridgeEvent::LocalNetworkPeer(local_peer("P1", 8080, 1)));
    availability(next_event(&mut h.events).await);

    h.coordinator.stop().await.unwrap();
    let gone = availability(next_event(&mut h.events).await);
    assert!(!gone.peer_available);
    assert_matches!(
        h.coordinator
            .get_peer_host_info(&"P1".into(), TransportKind::LocalNetwork)
            .await,
        Err(CoordinatorError::PeerNotAvailable { .. })
    );
}

#[tokio::test]
async fn test_idle_radio_peer_expires() {
    let config = CoordinatorConfig {
        tracker: TrackerConfig {
            radio_peer_idle_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        watcher_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let mut h = harness_with(config);
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    availability(next_event(&mut h.events).await);

    let gone = availability(next_event(&mut h.events).await);
    assert_eq!(gone.peer_identifier.as_str(), "alice");
    assert!(!gone.peer_available);
}

#[tokio::test]
async fn test_kill_connections_reaches_bridge() {
    let h = harness();
    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.coordinator.kill_connections().await.unwrap();
    assert_eq!(h.bridge.calls(), vec![BridgeCall::KillConnections]);
}

#[tokio::test]
async fn test_terminate_outgoing_is_idempotent() {
    let mut h = harness();
    let alice = PeerIdentifier::from("alice");
    // Before start: nothing to close.
    h.coordinator.terminate_outgoing_connection(&alice, 1234).await.unwrap();

    h.coordinator.start(EchoRouter::new()).await.unwrap();
    h.bridge.announce(vec![NativePeer::available("alice", TransportKind::RadioBeacon)]);
    availability(next_event(&mut h.events).await);
    let info = h
        .coordinator
        .get_peer_host_info(&alice, TransportKind::RadioBeacon)
        .await
        .unwrap();

    h.coordinator
        .terminate_outgoing_connection(&alice, info.port_number)
        .await
        .unwrap();
    h.coordinator
        .terminate_outgoing_connection(&alice, info.port_number)
        .await
        .unwrap();
}
