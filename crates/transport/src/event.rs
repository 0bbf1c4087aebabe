//! Events published to the application.

use strum::Display;
use vicinity_net_bridge::DiscoveryAdvertisingState;
use vicinity_net_mux::{IncomingConnectionId, IncomingConnectionState};
use vicinity_net_peers::{AvailabilityEvent, PeerAvailabilityChanged};
use vicinity_net_primitives::{NetworkStatus, PeerIdentifier, TransportKind};

/// Which listener stopped being reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ListenerFailure {
    /// The native stack could not reach the multiplexer's inbound listener.
    NativeListener,
    /// The multiplexer could not reach the application's listener.
    AppListener,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    PeerAvailabilityChanged(PeerAvailabilityChanged),
    /// Native discovery or advertising changed. Only sent while started, and only when
    /// different from the last one sent.
    DiscoveryAdvertisingStateUpdate(DiscoveryAdvertisingState),
    /// A listener failed for good; the coordinator has stopped itself.
    IncomingConnectionToPortNumberFailed {
        reason: ListenerFailure,
        /// The failure itself followed by anything that went wrong while stopping.
        errors: Vec<String>,
        port: u16,
    },
    NetworkChanged(NetworkStatus),
    /// A peer was dropped because its transport's cache is full.
    CacheOverflow {
        peer_identifier: PeerIdentifier,
        transport_kind: TransportKind,
    },
    /// A native connect failed.
    FailedConnection {
        peer_identifier: PeerIdentifier,
        transport_kind: Option<TransportKind>,
        error: String,
    },
    IncomingConnectionState {
        incoming_connection_id: IncomingConnectionId,
        state: IncomingConnectionState,
    },
}

impl From<AvailabilityEvent> for CoordinatorEvent {
    fn from(event: AvailabilityEvent) -> Self {
        match event {
            AvailabilityEvent::Changed(change) => Self::PeerAvailabilityChanged(change),
            AvailabilityEvent::CacheOverflow {
                peer_identifier,
                transport_kind,
            } => Self::CacheOverflow {
                peer_identifier,
                transport_kind,
            },
        }
    }
}
