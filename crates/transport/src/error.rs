use std::io;

use thiserror::Error;
use vicinity_net_bridge::BridgeError;
use vicinity_net_mux::MuxError;
use vicinity_net_peers::TrackerError;
use vicinity_net_primitives::{PeerIdentifier, TransportKind};
use vicinity_tasks::OperationError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator is not started")]
    NotStarted,
    #[error("coordinator is already started, stop it first")]
    AlreadyStarted,
    #[error("bad router: {0}")]
    BadRouter(String),
    #[error("peer {peer} is not available on {kind}")]
    PeerNotAvailable {
        peer: PeerIdentifier,
        kind: TransportKind,
    },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// Stop completed, but some teardown steps failed.
    #[error("stop finished with errors: {}", .0.join("; "))]
    Stop(Vec<String>),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("control operation panicked: {0}")]
    Panicked(String),
    #[error("control queue shut down before the operation settled")]
    QueueClosed,
}

impl From<TrackerError> for CoordinatorError {
    fn from(error: TrackerError) -> Self {
        match error {
            TrackerError::PeerNotAvailable { peer, kind } => Self::PeerNotAvailable { peer, kind },
        }
    }
}

impl From<MuxError> for CoordinatorError {
    fn from(error: MuxError) -> Self {
        match error {
            MuxError::NotStarted | MuxError::Stopped => Self::NotStarted,
            MuxError::Bridge(error) => Self::Bridge(error),
            MuxError::Io(error) => Self::Io(error),
        }
    }
}

impl From<OperationError<CoordinatorError>> for CoordinatorError {
    fn from(error: OperationError<CoordinatorError>) -> Self {
        match error {
            OperationError::Failed(error) => error,
            OperationError::Panicked(message) => Self::Panicked(message),
            OperationError::Dropped => Self::QueueClosed,
        }
    }
}

impl CoordinatorError {
    /// Individual failures, flattening the ones collected during a stop.
    pub fn into_messages(self) -> Vec<String> {
        match self {
            Self::Stop(errors) => errors,
            other => vec![other.to_string()],
        }
    }
}
