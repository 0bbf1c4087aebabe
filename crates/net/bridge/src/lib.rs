//! Contract with the platform's native radio stack.
//!
//! Calls go out through [`NativeBridge`]; everything the platform reports on its own
//! initiative comes back as [`BridgeEvent`]s pushed onto the channel created by
//! [`bridge_channel`]. The coordinator owns the receiving end and drains it from a
//! single task, so bridge callbacks never reach application code directly.
//!
//! The other side of the coordinator is the application, which receives connections
//! through a [`ConnectionRouter`].

mod router;

pub use router::ConnectionRouter;

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use vicinity_net_primitives::{Generation, NetworkStatus, PeerIdentifier, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("native {call} failed: {reason}")]
    CallFailed { call: &'static str, reason: String },
    #[error("native {0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("native bridge is closed")]
    Closed,
}

impl BridgeError {
    pub fn call_failed(call: &'static str, reason: impl Into<String>) -> Self {
        Self::CallFailed {
            call,
            reason: reason.into(),
        }
    }
}

/// Calls into the native stack.
///
/// Every call settles exactly once. Callers never keep two non-connect calls in flight
/// at the same time.
#[async_trait]
pub trait NativeBridge: Send + Sync + 'static {
    async fn start_listening_for_advertisements(&self) -> Result<(), BridgeError>;

    async fn stop_listening_for_advertisements(&self) -> Result<(), BridgeError>;

    /// Starts (or refreshes) advertising; sessions from remote peers are pushed to
    /// `port` on the loopback interface.
    async fn start_update_advertising_and_listening(&self, port: u16) -> Result<(), BridgeError>;

    async fn stop_advertising_and_listening(&self) -> Result<(), BridgeError>;

    /// Opens a native session to `peer` and returns the loopback port it is exposed on.
    async fn connect(&self, peer: &PeerIdentifier) -> Result<u16, BridgeError>;

    /// Tears down the native session to `peer`, if any.
    async fn disconnect(&self, peer: &PeerIdentifier) -> Result<(), BridgeError>;

    /// Drops every native session without touching discovery or advertising.
    async fn kill_connections(&self) -> Result<(), BridgeError>;
}

/// Peer reported by the native stack.
///
/// Carries no address: radio peers are given a local port by the multiplexer, multipeer
/// peers get one when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePeer {
    pub peer_identifier: PeerIdentifier,
    pub transport_kind: TransportKind,
    pub available: bool,
    pub generation: Option<Generation>,
    /// The remote asked us to open a session to it.
    pub please_connect: bool,
}

impl NativePeer {
    pub fn available(peer: impl Into<PeerIdentifier>, kind: TransportKind) -> Self {
        Self {
            peer_identifier: peer.into(),
            transport_kind: kind,
            available: true,
            generation: None,
            please_connect: false,
        }
    }

    pub fn unavailable(peer: impl Into<PeerIdentifier>, kind: TransportKind) -> Self {
        Self {
            available: false,
            ..Self::available(peer, kind)
        }
    }

    #[must_use]
    pub fn with_generation(mut self, generation: impl Into<Generation>) -> Self {
        self.generation = Some(generation.into());
        self
    }

    #[must_use]
    pub fn with_please_connect(mut self) -> Self {
        self.please_connect = true;
        self
    }
}

/// Peer announced (or withdrawn) on the local network.
///
/// A missing address or port means the peer left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetworkPeer {
    pub peer_identifier: PeerIdentifier,
    pub generation: Option<Generation>,
    pub host_address: Option<IpAddr>,
    pub port_number: Option<u16>,
}

impl LocalNetworkPeer {
    pub fn is_available(&self) -> bool {
        self.host_address.is_some() && self.port_number.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DiscoveryAdvertisingState {
    pub discovery_active: bool,
    pub advertising_active: bool,
}

/// Notification pushed by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    PeerAvailabilityChanged(Vec<NativePeer>),
    LocalNetworkPeer(LocalNetworkPeer),
    /// Local network discovery went down; no further announcements will arrive.
    LocalNetworkDiscoveryStopped,
    NetworkChanged(NetworkStatus),
    DiscoveryAdvertisingState(DiscoveryAdvertisingState),
    /// The native stack could no longer reach the listener on `port`.
    IncomingConnectionToPortNumberFailed { port: u16 },
}

/// Sender half handed to the native stack.
pub type BridgeEventSender = mpsc::UnboundedSender<BridgeEvent>;

/// Receiver half consumed by the coordinator.
pub type BridgeEventReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

/// Creates the channel native callbacks are funnelled through.
///
/// Unbounded so platform callbacks never block.
pub fn bridge_channel() -> (BridgeEventSender, BridgeEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_network_peer_availability() {
        let mut peer = LocalNetworkPeer {
            peer_identifier: "p".into(),
            generation: None,
            host_address: Some("10.0.0.5".parse().unwrap()),
            port_number: Some(8080),
        };
        assert!(peer.is_available());

        peer.port_number = None;
        assert!(!peer.is_available());
    }

    #[tokio::test]
    async fn test_bridge_channel_preserves_order() {
        let (tx, mut rx) = bridge_channel();
        tx.send(BridgeEvent::LocalNetworkDiscoveryStopped).unwrap();
        tx.send(BridgeEvent::IncomingConnectionToPortNumberFailed { port: 4242 })
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(BridgeEvent::LocalNetworkDiscoveryStopped)
        );
        assert_eq!(
            rx.recv().await,
            Some(BridgeEvent::IncomingConnectionToPortNumberFailed { port: 4242 })
        );
    }

    #[test]
    fn test_call_failed_message() {
        let err = BridgeError::call_failed("connect", "timed out");
        assert_eq!(err.to_string(), "native connect failed: timed out");
    }
}
