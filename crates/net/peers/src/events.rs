//! Availability events and non-blocking broadcast emitter.

use std::fmt::Debug;

use tokio::sync::broadcast;
use vicinity_net_primitives::{Generation, PeerIdentifier, TransportKind};

/// A peer appeared, changed or went away on one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAvailabilityChanged {
    pub peer_identifier: PeerIdentifier,
    pub transport_kind: TransportKind,
    pub peer_available: bool,
    /// Unset when the peer is unavailable.
    pub generation: Option<Generation>,
    /// Unset when the peer is unavailable; true when the peer moved address or port.
    pub new_address_port: Option<bool>,
}

impl PeerAvailabilityChanged {
    pub fn available(
        peer_identifier: PeerIdentifier,
        transport_kind: TransportKind,
        generation: Option<Generation>,
        new_address_port: bool,
    ) -> Self {
        Self {
            peer_identifier,
            transport_kind,
            peer_available: true,
            generation,
            new_address_port: Some(new_address_port),
        }
    }

    pub fn unavailable(peer_identifier: PeerIdentifier, transport_kind: TransportKind) -> Self {
        Self {
            peer_identifier,
            transport_kind,
            peer_available: false,
            generation: None,
            new_address_port: None,
        }
    }
}

/// Outcome of feeding the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityEvent {
    Changed(PeerAvailabilityChanged),
    /// Inserting the peer would have exceeded the per-kind capacity; it was dropped.
    CacheOverflow {
        peer_identifier: PeerIdentifier,
        transport_kind: TransportKind,
    },
}

impl AvailabilityEvent {
    pub fn peer_identifier(&self) -> &PeerIdentifier {
        match self {
            Self::Changed(change) => &change.peer_identifier,
            Self::CacheOverflow {
                peer_identifier, ..
            } => peer_identifier,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self {
            Self::Changed(change) => change.transport_kind,
            Self::CacheOverflow { transport_kind, .. } => *transport_kind,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Changed(change) if !change.peer_available)
    }
}

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast emitter. Slow subscribers drop events independently.
#[derive(Debug)]
pub struct EventEmitter<E> {
    tx: broadcast::Sender<E>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Clone + Debug> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl<E: Clone + Debug> EventEmitter<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = E>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
