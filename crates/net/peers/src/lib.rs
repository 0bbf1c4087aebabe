//! Peer availability tracking for non-IP and local network transports.
//!
//! [`PeerAvailabilityTracker`] is the de-duplication boundary between noisy transport
//! notifications and the application: it only reports a peer as available again when
//! its address, port or generation actually changed.

mod config;
mod error;
pub mod events;
mod metrics;
mod record;
mod tracker;

pub use config::{SuggestedTimeouts, TrackerConfig};
pub use error::TrackerError;
pub use events::{AvailabilityEvent, EventEmitter, PeerAvailabilityChanged};
pub use record::{LocalNetworkEntry, PeerRecord, PeerRecordKind, RadioEntry};
pub use tracker::{HostInfoResolution, PeerAvailabilityTracker, PeerNotification};
