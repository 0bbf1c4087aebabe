//! Test utilities for vicinity crates.
//!
//! [`MockBridge`] stands in for the platform radio stack. Native sessions it opens are
//! real loopback echo servers, so everything above it runs over actual sockets.
//! [`EchoRouter`] and [`RejectingRouter`] play the application side.

mod bridge;
mod net;
mod router;

pub use bridge::{BridgeCall, MockBridge};
pub use net::{EchoServer, echo, read_exactly};
pub use router::{EchoRouter, RejectingRouter};
