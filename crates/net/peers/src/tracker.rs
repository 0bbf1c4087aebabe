//! Peer availability cache.
//!
//! Decides whether a notification from a transport is a real change and turns it into
//! [`AvailabilityEvent`]s. Each transport kind has its own rules:
//!
//! - Radio peers never report that they left. They stay until their idle deadline
//!   passes without a refresh or an open session, until a connection to them fails, or
//!   until the radio goes down. A beacon generation that stays the same for longer than
//!   it takes the one byte counter to wrap is treated as a new generation.
//! - Multipeer peers change only when their generation moves forward and leave on an
//!   explicit notification.
//! - Local network peers change with a newer generation or a new address or port and
//!   leave when announced without an address, or when their announcements stop.
//!
//! The tracker never touches the clock itself; callers pass `now` in.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, trace, warn};
use vicinity_net_primitives::{Generation, LOOPBACK, PeerHostInfo, PeerIdentifier, TransportKind};
use web_time::Instant;

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::events::{AvailabilityEvent, PeerAvailabilityChanged};
use crate::metrics::TrackerMetrics;
use crate::record::{LocalNetworkEntry, PeerRecord, PeerRecordKind, RadioEntry};

/// Raw availability report from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNotification {
    pub peer_identifier: PeerIdentifier,
    pub transport_kind: TransportKind,
    pub available: bool,
    pub host_address: Option<IpAddr>,
    pub port_number: Option<u16>,
    pub generation: Option<Generation>,
}

impl PeerNotification {
    pub fn available(peer: impl Into<PeerIdentifier>, kind: TransportKind) -> Self {
        Self {
            peer_identifier: peer.into(),
            transport_kind: kind,
            available: true,
            host_address: None,
            port_number: None,
            generation: None,
        }
    }

    pub fn unavailable(peer: impl Into<PeerIdentifier>, kind: TransportKind) -> Self {
        Self {
            available: false,
            ..Self::available(peer, kind)
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port_number = Some(port);
        self
    }

    #[must_use]
    pub fn with_address(mut self, host: IpAddr, port: u16) -> Self {
        self.host_address = Some(host);
        self.port_number = Some(port);
        self
    }

    #[must_use]
    pub fn with_generation(mut self, generation: impl Into<Generation>) -> Self {
        self.generation = Some(generation.into());
        self
    }
}

/// Result of a host info lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInfoResolution {
    Ready(PeerHostInfo),
    /// The peer is available but its port only exists once a native session is open.
    ResolveThroughMux { suggested_tcp_timeout: Duration },
}

type PeerMap = HashMap<PeerIdentifier, PeerRecord>;

/// In-memory cache of available peers, keyed by peer identifier and transport kind.
#[derive(Debug)]
pub struct PeerAvailabilityTracker {
    config: TrackerConfig,
    peers: HashMap<TransportKind, PeerMap>,
    metrics: TrackerMetrics,
}

impl Default for PeerAvailabilityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl PeerAvailabilityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            metrics: TrackerMetrics::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, kind: TransportKind) -> usize {
        self.peers.get(&kind).map_or(0, HashMap::len)
    }

    pub fn get(&self, peer: &str, kind: TransportKind) -> Option<&PeerRecord> {
        self.peers.get(&kind)?.get(peer)
    }

    pub fn contains(&self, peer: &str, kind: TransportKind) -> bool {
        self.get(peer, kind).is_some()
    }

    /// Cached peers of one kind, in no particular order.
    pub fn peers_of(&self, kind: TransportKind) -> impl Iterator<Item = &PeerRecord> {
        self.peers.get(&kind).into_iter().flat_map(HashMap::values)
    }

    /// Returns the [`AvailabilityEvent::CacheOverflow`] for `peer` if it is not cached
    /// yet and `kind` is already full. Lets callers refuse a peer before spending
    /// resources on it.
    pub fn check_capacity(
        &mut self,
        peer: &PeerIdentifier,
        kind: TransportKind,
    ) -> Option<AvailabilityEvent> {
        let capacity = self.config.capacity_per_kind;
        if self.contains(peer.as_str(), kind) || self.len_of(kind) < capacity {
            return None;
        }
        warn!(%peer, %kind, capacity, "availability cache full, possible discovery flood");
        self.metrics.inc_overflow(kind);
        Some(AvailabilityEvent::CacheOverflow {
            peer_identifier: peer.clone(),
            transport_kind: kind,
        })
    }

    pub fn handle_notification(
        &mut self,
        notification: PeerNotification,
        now: Instant,
    ) -> Vec<AvailabilityEvent> {
        match notification.transport_kind {
            TransportKind::RadioClassic | TransportKind::RadioBeacon => {
                self.handle_radio(notification, now)
            }
            TransportKind::MultipeerFramework => self.handle_multipeer(notification, now),
            TransportKind::LocalNetwork => self.handle_local_network(notification, now),
        }
    }

    fn handle_radio(&mut self, n: PeerNotification, now: Instant) -> Vec<AvailabilityEvent> {
        let kind = n.transport_kind;
        if !n.available {
            return self.remove(&n.peer_identifier, kind).into_iter().collect();
        }
        let Some(port) = n.port_number else {
            warn!(peer = %n.peer_identifier, %kind, "radio peer announced without a port, ignoring");
            return Vec::new();
        };

        let idle_timeout = self.config.radio_peer_idle_timeout;
        let rollover_window = self.config.beacon_rollover_window();

        let Some(record) = self.record_mut(&n.peer_identifier, kind) else {
            let entry = RadioEntry {
                port_number: port,
                has_open_session: false,
                idle_deadline: Some(now + idle_timeout),
            };
            let record_kind = match kind {
                TransportKind::RadioClassic => PeerRecordKind::RadioClassic(entry),
                _ => PeerRecordKind::RadioBeacon(entry),
            };
            return self.insert(n.peer_identifier, n.generation, record_kind, now);
        };

        let PeerRecord {
            generation,
            last_changed,
            kind: PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry),
            ..
        } = record
        else {
            return Vec::new();
        };

        if !entry.has_open_session {
            entry.idle_deadline = Some(now + idle_timeout);
        }

        let port_changed = entry.port_number != port;
        let generation_changed = n.generation.is_some_and(|g| *generation != Some(g));
        let wrapped = now.saturating_duration_since(*last_changed) >= rollover_window;
        if !(port_changed || generation_changed || wrapped) {
            trace!(peer = %n.peer_identifier, %kind, "duplicate radio notification");
            return Vec::new();
        }

        entry.port_number = port;
        if n.generation.is_some() {
            *generation = n.generation;
        }
        *last_changed = now;
        debug!(
            peer = %n.peer_identifier,
            %kind,
            port,
            port_changed,
            wrapped,
            "radio peer changed"
        );
        vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
            n.peer_identifier,
            kind,
            *generation,
            port_changed,
        ))]
    }

    fn handle_multipeer(&mut self, n: PeerNotification, now: Instant) -> Vec<AvailabilityEvent> {
        let kind = TransportKind::MultipeerFramework;
        if !n.available {
            return self.remove(&n.peer_identifier, kind).into_iter().collect();
        }

        let Some(record) = self.record_mut(&n.peer_identifier, kind) else {
            return self.insert(
                n.peer_identifier,
                n.generation,
                PeerRecordKind::MultipeerFramework,
                now,
            );
        };

        let newer = match (n.generation, record.generation) {
            (Some(new), Some(old)) => new.is_newer_than(old),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer {
            trace!(peer = %n.peer_identifier, generation = ?n.generation, "stale multipeer generation");
            return Vec::new();
        }

        record.generation = n.generation;
        record.last_changed = now;
        debug!(peer = %n.peer_identifier, generation = ?n.generation, "multipeer peer changed");
        vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
            n.peer_identifier,
            kind,
            n.generation,
            false,
        ))]
    }

    fn handle_local_network(
        &mut self,
        n: PeerNotification,
        now: Instant,
    ) -> Vec<AvailabilityEvent> {
        let kind = TransportKind::LocalNetwork;
        let (Some(host), Some(port), true) = (n.host_address, n.port_number, n.available) else {
            return self.remove(&n.peer_identifier, kind).into_iter().collect();
        };

        let idle_deadline = now + self.config.local_network_idle_timeout;
        let Some(record) = self.record_mut(&n.peer_identifier, kind) else {
            let entry = LocalNetworkEntry {
                host_address: host,
                port_number: port,
                idle_deadline,
            };
            return self.insert(
                n.peer_identifier,
                n.generation,
                PeerRecordKind::LocalNetwork(entry),
                now,
            );
        };

        let PeerRecord {
            generation,
            last_changed,
            kind: PeerRecordKind::LocalNetwork(entry),
            ..
        } = record
        else {
            return Vec::new();
        };

        entry.idle_deadline = idle_deadline;

        let address_changed = entry.host_address != host || entry.port_number != port;
        let generation_newer = n
            .generation
            .is_some_and(|new| generation.is_none_or(|old| new.is_newer_than(old)));
        if !(address_changed || generation_newer) {
            trace!(peer = %n.peer_identifier, "duplicate local network announcement");
            return Vec::new();
        }

        entry.host_address = host;
        entry.port_number = port;
        if n.generation.is_some() {
            *generation = n.generation;
        }
        *last_changed = now;
        debug!(
            peer = %n.peer_identifier,
            %host,
            port,
            address_changed,
            "local network peer changed"
        );
        vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
            n.peer_identifier,
            kind,
            *generation,
            address_changed,
        ))]
    }

    /// Evicts every peer of `kind`, e.g. when its radio or discovery went down.
    pub fn handle_transport_reset(&mut self, kind: TransportKind) -> Vec<AvailabilityEvent> {
        let Some(peers) = self.peers.remove(&kind) else {
            return Vec::new();
        };
        self.metrics.set_cached(kind, 0);
        if !peers.is_empty() {
            debug!(%kind, evicted = peers.len(), "transport reset");
        }

        let mut evicted: Vec<_> = peers.into_keys().collect();
        evicted.sort();
        evicted
            .into_iter()
            .map(|peer| AvailabilityEvent::Changed(PeerAvailabilityChanged::unavailable(peer, kind)))
            .collect()
    }

    /// A connection attempt through the multiplexer failed.
    ///
    /// Radio peers are dropped. Multipeer peers are announced again with
    /// `new_address_port` set so whoever asked can try again; nothing is retried here.
    pub fn handle_failed_connection(
        &mut self,
        peer: &PeerIdentifier,
        kind: TransportKind,
        now: Instant,
    ) -> Vec<AvailabilityEvent> {
        match kind {
            TransportKind::RadioClassic | TransportKind::RadioBeacon => {
                self.remove(peer, kind).into_iter().collect()
            }
            TransportKind::MultipeerFramework => {
                let Some(record) = self.record_mut(peer, kind) else {
                    trace!(%peer, "failed connection to unknown multipeer peer");
                    return Vec::new();
                };
                record.last_changed = now;
                vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
                    peer.clone(),
                    kind,
                    record.generation,
                    true,
                ))]
            }
            TransportKind::LocalNetwork => Vec::new(),
        }
    }

    /// Records whether a session to a radio peer is open. While one is, the peer does not
    /// idle out. Returns false if the peer is not cached.
    pub fn set_session_open(
        &mut self,
        peer: &PeerIdentifier,
        kind: TransportKind,
        open: bool,
        now: Instant,
    ) -> bool {
        let idle_timeout = self.config.radio_peer_idle_timeout;
        let Some(entry) = self
            .record_mut(peer, kind)
            .and_then(PeerRecord::radio_entry_mut)
        else {
            return false;
        };
        entry.has_open_session = open;
        entry.idle_deadline = (!open).then(|| now + idle_timeout);
        true
    }

    /// Where to connect to `peer`.
    ///
    /// A successful lookup of a radio peer counts as an open session.
    pub fn host_info(
        &mut self,
        peer: &PeerIdentifier,
        kind: TransportKind,
    ) -> Result<HostInfoResolution, TrackerError> {
        let suggested_tcp_timeout = self.config.suggested_timeouts.for_kind(kind);
        let not_available = || TrackerError::PeerNotAvailable {
            peer: peer.clone(),
            kind,
        };
        let record = self.record_mut(peer, kind).ok_or_else(not_available)?;

        match &mut record.kind {
            PeerRecordKind::RadioClassic(entry) | PeerRecordKind::RadioBeacon(entry) => {
                entry.has_open_session = true;
                entry.idle_deadline = None;
                Ok(HostInfoResolution::Ready(PeerHostInfo {
                    host_address: LOOPBACK,
                    port_number: entry.port_number,
                    suggested_tcp_timeout,
                }))
            }
            PeerRecordKind::MultipeerFramework => {
                Ok(HostInfoResolution::ResolveThroughMux {
                    suggested_tcp_timeout,
                })
            }
            PeerRecordKind::LocalNetwork(entry) => Ok(HostInfoResolution::Ready(PeerHostInfo {
                host_address: entry.host_address,
                port_number: entry.port_number,
                suggested_tcp_timeout,
            })),
        }
    }

    /// Drops every peer whose idle deadline passed.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<AvailabilityEvent> {
        let mut events = Vec::new();
        for (kind, peers) in &mut self.peers {
            let mut expired: Vec<_> = peers
                .values()
                .filter(|record| record.is_idle(now))
                .map(|record| record.peer_identifier.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            expired.sort();
            for peer in expired {
                peers.remove(&peer);
                debug!(%peer, %kind, "peer idle, marking unavailable");
                events.push(AvailabilityEvent::Changed(PeerAvailabilityChanged::unavailable(
                    peer, *kind,
                )));
            }
            self.metrics.set_cached(*kind, peers.len());
        }
        events
    }

    /// Evicts everything.
    pub fn clear(&mut self) -> Vec<AvailabilityEvent> {
        TransportKind::ALL
            .into_iter()
            .flat_map(|kind| self.handle_transport_reset(kind))
            .collect()
    }

    fn record_mut(&mut self, peer: &PeerIdentifier, kind: TransportKind) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&kind)?.get_mut(peer)
    }

    fn insert(
        &mut self,
        peer: PeerIdentifier,
        generation: Option<Generation>,
        record_kind: PeerRecordKind,
        now: Instant,
    ) -> Vec<AvailabilityEvent> {
        let kind = match record_kind {
            PeerRecordKind::RadioClassic(_) => TransportKind::RadioClassic,
            PeerRecordKind::RadioBeacon(_) => TransportKind::RadioBeacon,
            PeerRecordKind::MultipeerFramework => TransportKind::MultipeerFramework,
            PeerRecordKind::LocalNetwork(_) => TransportKind::LocalNetwork,
        };
        if let Some(overflow) = self.check_capacity(&peer, kind) {
            return vec![overflow];
        }
        let peers = self.peers.entry(kind).or_default();
        peers.insert(
            peer.clone(),
            PeerRecord {
                peer_identifier: peer.clone(),
                generation,
                available_since: now,
                last_changed: now,
                kind: record_kind,
            },
        );
        self.metrics.set_cached(kind, peers.len());
        debug!(%peer, %kind, ?generation, "peer available");
        vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
            peer, kind, generation, false,
        ))]
    }

    fn remove(&mut self, peer: &PeerIdentifier, kind: TransportKind) -> Option<AvailabilityEvent> {
        let peers = self.peers.get_mut(&kind)?;
        let record = peers.remove(peer)?;
        self.metrics.set_cached(kind, peers.len());
        debug!(%peer, %kind, "peer unavailable");
        Some(AvailabilityEvent::Changed(PeerAvailabilityChanged::unavailable(
            record.peer_identifier,
            kind,
        )))
    }
}
