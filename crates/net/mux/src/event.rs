//! Notifications from the multiplexer to its owner.

use std::fmt;

use strum::Display;
use tokio::sync::mpsc;
use vicinity_net_primitives::PeerIdentifier;

/// Opaque handle of one inbound session. Only good for equality checks and
/// [`terminate_incoming_connection`](crate::ConnectionMultiplexer::terminate_incoming_connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncomingConnectionId(pub(crate) u64);

impl fmt::Display for IncomingConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incoming-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum IncomingConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// An inbound native session could not be handed to the application router.
    RouterPortConnectionFailed { router_port: u16, error: String },
    /// A native connect to the peer failed.
    FailedConnection {
        peer_identifier: PeerIdentifier,
        error: String,
    },
    IncomingConnectionState {
        incoming_connection_id: IncomingConnectionId,
        state: IncomingConnectionState,
    },
    /// The peer's listener was replaced after its sessions idled out; reconnect on
    /// `port_number`.
    ListenerRecreatedAfterFailure {
        peer_identifier: PeerIdentifier,
        port_number: u16,
    },
}

pub type MuxEventSender = mpsc::UnboundedSender<MuxEvent>;

pub type MuxEventReceiver = mpsc::UnboundedReceiver<MuxEvent>;

pub fn mux_channel() -> (MuxEventSender, MuxEventReceiver) {
    mpsc::unbounded_channel()
}
