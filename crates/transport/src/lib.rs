//! Transport lifecycle for peers reachable over non-IP and local network transports.
//!
//! [`TransportCoordinator`] sits between the application and the native radio stack.
//! It starts and stops the stack, decides through a
//! [`PeerAvailabilityTracker`](vicinity_net_peers::PeerAvailabilityTracker) which
//! notifications are real changes, and hands out local TCP endpoints for every
//! available peer.

mod config;
mod coordinator;
mod driver;
mod error;
mod event;
mod listener;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorLifecycle, TransportCoordinator};
pub use error::CoordinatorError;
pub use event::{CoordinatorEvent, ListenerFailure};
