//! TCP virtualisation for transports that have no IP addressing.
//!
//! The application only ever sees loopback TCP: inbound native sessions arrive at its
//! router as ordinary connections, and every remote peer is reachable through a local
//! port handed out by [`ConnectionMultiplexer::create_peer_listener`].

mod config;
mod error;
mod event;
mod inbound;
mod metrics;
mod mux;
mod outbound;
mod relay;

pub use config::MuxConfig;
pub use error::MuxError;
pub use event::{
    IncomingConnectionId, IncomingConnectionState, MuxEvent, MuxEventReceiver, MuxEventSender,
    mux_channel,
};
pub use mux::{ConnectionMultiplexer, MuxLifecycle};
