//! Cached availability of one peer on one transport.

use std::net::IpAddr;

use vicinity_net_primitives::{Generation, LOOPBACK, PeerIdentifier, TransportKind};
use web_time::Instant;

/// Radio peers are reached through a local listener on the loopback interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioEntry {
    pub port_number: u16,
    pub has_open_session: bool,
    /// Unset while a session is open.
    pub idle_deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetworkEntry {
    pub host_address: IpAddr,
    pub port_number: u16,
    pub idle_deadline: Instant,
}

/// Transport specific part of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRecordKind {
    RadioClassic(RadioEntry),
    RadioBeacon(RadioEntry),
    /// Port is resolved through a connect when asked for.
    MultipeerFramework,
    LocalNetwork(LocalNetworkEntry),
}

/// A peer currently considered available. Absence from the cache means unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_identifier: PeerIdentifier,
    pub generation: Option<Generation>,
    pub available_since: Instant,
    /// Last time an availability event was issued for this record.
    pub last_changed: Instant,
    pub kind: PeerRecordKind,
}

impl PeerRecord {
    pub fn transport_kind(&self) -> TransportKind {
        match self.kind {
            PeerRecordKind::RadioClassic(_) => TransportKind::RadioClassic,
            PeerRecordKind::RadioBeacon(_) => TransportKind::RadioBeacon,
            PeerRecordKind::MultipeerFramework => TransportKind::MultipeerFramework,
            PeerRecordKind::LocalNetwork(_) => TransportKind::LocalNetwork,
        }
    }

    pub fn host_address(&self) -> Option<IpAddr> {
        match &self.kind {
            PeerRecordKind::RadioClassic(_) | PeerRecordKind::RadioBeacon(_) => Some(LOOPBACK),
            PeerRecordKind::MultipeerFramework => None,
            PeerRecordKind::LocalNetwork(entry) => Some(entry.host_address),
        }
    }

    pub fn port_number(&self) -> Option<u16> {
        match &self.kind {
            PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry) => {
                Some(entry.port_number)
            }
            PeerRecordKind::MultipeerFramework => None,
            PeerRecordKind::LocalNetwork(entry) => Some(entry.port_number),
        }
    }

    pub fn has_open_session(&self) -> bool {
        match &self.kind {
            PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry) => {
                entry.has_open_session
            }
            _ => false,
        }
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        match &self.kind {
            PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry) => {
                entry.idle_deadline
            }
            PeerRecordKind::MultipeerFramework => None,
            PeerRecordKind::LocalNetwork(entry) => Some(entry.idle_deadline),
        }
    }

    pub(crate) fn radio_entry_mut(&mut self) -> Option<&mut RadioEntry> {
        match &mut self.kind {
            PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry) => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn is_idle(&self, now: Instant) -> bool {
        self.idle_deadline().is_some_and(|deadline| deadline <= now)
    }
}
