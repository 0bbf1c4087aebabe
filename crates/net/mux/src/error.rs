use thiserror::Error;
use vicinity_net_bridge::BridgeError;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer has not been started")]
    NotStarted,
    #[error("multiplexer is stopped")]
    Stopped,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
