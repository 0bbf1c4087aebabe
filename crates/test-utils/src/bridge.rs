use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use vicinity_net_bridge::{
    BridgeError, BridgeEvent, BridgeEventReceiver, BridgeEventSender, NativeBridge, NativePeer,
    bridge_channel,
};
use vicinity_net_primitives::{NetworkStatus, PeerIdentifier};

use crate::net::EchoServer;

/// A call made on the mock bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    StartListeningForAdvertisements,
    StopListeningForAdvertisements,
    StartUpdateAdvertisingAndListening { port: u16 },
    StopAdvertisingAndListening,
    Connect(PeerIdentifier),
    Disconnect(PeerIdentifier),
    KillConnections,
}

impl BridgeCall {
    /// Name used to configure failures, matching [`BridgeError::CallFailed`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartListeningForAdvertisements => "start_listening_for_advertisements",
            Self::StopListeningForAdvertisements => "stop_listening_for_advertisements",
            Self::StartUpdateAdvertisingAndListening { .. } => {
                "start_update_advertising_and_listening"
            }
            Self::StopAdvertisingAndListening => "stop_advertising_and_listening",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::KillConnections => "kill_connections",
        }
    }
}

/// In-process native bridge.
///
/// Records every call, fails calls on request and serves each connected peer with a
/// loopback echo server standing in for the native session.
#[derive(Debug)]
pub struct MockBridge {
    events: BridgeEventSender,
    calls: Mutex<Vec<BridgeCall>>,
    failures: Mutex<HashMap<&'static str, String>>,
    sessions: Mutex<HashMap<PeerIdentifier, EchoServer>>,
    advertising_port: Mutex<Option<u16>>,
    control_in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl MockBridge {
    pub fn new() -> (Arc<Self>, BridgeEventReceiver) {
        let (events, rx) = bridge_channel();
        let bridge = Self {
            events,
            calls: Mutex::default(),
            failures: Mutex::default(),
            sessions: Mutex::default(),
            advertising_port: Mutex::default(),
            control_in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        };
        (Arc::new(bridge), rx)
    }

    /// Makes every later call named `call` fail with `reason`.
    pub fn fail(&self, call: &'static str, reason: impl Into<String>) {
        self.failures.lock().insert(call, reason.into());
    }

    pub fn succeed(&self, call: &'static str) {
        self.failures.lock().remove(call);
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn connect_count(&self, peer: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, BridgeCall::Connect(p) if p.as_str() == peer))
            .count()
    }

    /// Whether two non-connect calls were ever in flight at the same time.
    pub fn saw_overlapping_calls(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Port handed to the last advertising call, where inbound sessions are pushed.
    pub fn advertising_port(&self) -> Option<u16> {
        *self.advertising_port.lock()
    }

    pub fn has_native_session(&self, peer: &str) -> bool {
        self.sessions.lock().contains_key(peer)
    }

    /// Kills the native session to `peer` as if the remote went away.
    pub fn drop_native_session(&self, peer: &str) {
        self.sessions.lock().remove(peer);
    }

    pub fn push(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    pub fn announce(&self, peers: Vec<NativePeer>) {
        self.push(BridgeEvent::PeerAvailabilityChanged(peers));
    }

    pub fn network_changed(&self, status: NetworkStatus) {
        self.push(BridgeEvent::NetworkChanged(status));
    }

    /// Opens an inbound native session to the advertised port, as a remote peer would.
    pub async fn connect_inbound(&self) -> std::io::Result<TcpStream> {
        let port = self.advertising_port().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "not advertising")
        })?;
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await
    }

    fn record(&self, call: BridgeCall) -> Result<(), BridgeError> {
        let name = call.name();
        self.calls.lock().push(call);
        match self.failures.lock().get(name) {
            Some(reason) => Err(BridgeError::call_failed(name, reason.clone())),
            None => Ok(()),
        }
    }

    async fn control(&self, call: BridgeCall) -> Result<(), BridgeError> {
        if self.control_in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        // Give a concurrent caller the chance to overlap.
        tokio::task::yield_now().await;
        let result = self.record(call);
        self.control_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl NativeBridge for MockBridge {
    async fn start_listening_for_advertisements(&self) -> Result<(), BridgeError> {
        self.control(BridgeCall::StartListeningForAdvertisements).await
    }

    async fn stop_listening_for_advertisements(&self) -> Result<(), BridgeError> {
        self.control(BridgeCall::StopListeningForAdvertisements).await
    }

    async fn start_update_advertising_and_listening(&self, port: u16) -> Result<(), BridgeError> {
        self.control(BridgeCall::StartUpdateAdvertisingAndListening { port })
            .await?;
        *self.advertising_port.lock() = Some(port);
        Ok(())
    }

    async fn stop_advertising_and_listening(&self) -> Result<(), BridgeError> {
        self.control(BridgeCall::StopAdvertisingAndListening).await?;
        *self.advertising_port.lock() = None;
        Ok(())
    }

    async fn connect(&self, peer: &PeerIdentifier) -> Result<u16, BridgeError> {
        self.record(BridgeCall::Connect(peer.clone()))?;
        let server = EchoServer::bind()
            .await
            .map_err(|e| BridgeError::call_failed("connect", e.to_string()))?;
        let port = server.port();
        self.sessions.lock().insert(peer.clone(), server);
        Ok(port)
    }

    async fn disconnect(&self, peer: &PeerIdentifier) -> Result<(), BridgeError> {
        self.record(BridgeCall::Disconnect(peer.clone()))?;
        self.sessions.lock().remove(peer);
        Ok(())
    }

    async fn kill_connections(&self) -> Result<(), BridgeError> {
        self.control(BridgeCall::KillConnections).await?;
        self.sessions.lock().clear();
        Ok(())
    }
}
