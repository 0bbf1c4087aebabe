#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use vicinity_net_bridge::BridgeEventReceiver;
use vicinity_test_utils::{MockBridge, read_exactly};
use vicinity_transport::{CoordinatorConfig, CoordinatorEvent, TransportCoordinator};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub coordinator: TransportCoordinator,
    pub bridge: Arc<MockBridge>,
    pub events: broadcast::Receiver<CoordinatorEvent>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

pub fn harness() -> Harness {
    harness_with(CoordinatorConfig::default())
}

pub fn harness_with(config: CoordinatorConfig) -> Harness {
    init_tracing();
    let (bridge, bridge_events): (_, BridgeEventReceiver) = MockBridge::new();
    let coordinator = TransportCoordinator::spawn(bridge.clone(), bridge_events, config);
    let events = coordinator.subscribe();
    Harness {
        coordinator,
        bridge,
        events,
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<CoordinatorEvent>) -> CoordinatorEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => return event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// Skips events until one matches.
pub async fn next_matching(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    mut matches: impl FnMut(&CoordinatorEvent) -> bool,
) -> CoordinatorEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Asserts nothing is published for a short while.
pub async fn assert_quiet(events: &mut broadcast::Receiver<CoordinatorEvent>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {outcome:?}");
}

pub async fn round_trip(port: u16, payload: &[u8]) {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let back = tokio::time::timeout(WAIT, read_exactly(&mut stream, payload.len()))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(back, payload);
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
