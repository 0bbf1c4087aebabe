use thiserror::Error;
use vicinity_net_primitives::{PeerIdentifier, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("peer {peer} is not available over {kind}")]
    PeerNotAvailable {
        peer: PeerIdentifier,
        kind: TransportKind,
    },
}
