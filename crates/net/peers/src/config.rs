//! Tracker configuration.

use std::time::Duration;

use vicinity_net_primitives::{Generation, TransportKind};

/// Connect timeouts handed to the application with a peer's host info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuggestedTimeouts {
    pub radio: Duration,
    pub multipeer: Duration,
    pub local_network: Duration,
}

impl Default for SuggestedTimeouts {
    fn default() -> Self {
        Self {
            radio: Duration::from_secs(10),
            multipeer: Duration::from_secs(10),
            local_network: Duration::from_secs(5),
        }
    }
}

impl SuggestedTimeouts {
    pub fn for_kind(&self, kind: TransportKind) -> Duration {
        match kind {
            TransportKind::RadioClassic | TransportKind::RadioBeacon => self.radio,
            TransportKind::MultipeerFramework => self.multipeer,
            TransportKind::LocalNetwork => self.local_network,
        }
    }
}

/// Peer availability tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Radio peers with no open session are dropped after this long without a refresh.
    pub radio_peer_idle_timeout: Duration,
    /// Local network peers are dropped after this long without an announcement.
    pub local_network_idle_timeout: Duration,
    /// Shortest interval at which a transport bumps a peer's generation.
    pub minimum_update_window: Duration,
    /// Maximum number of cached peers per transport kind.
    pub capacity_per_kind: usize,
    pub suggested_timeouts: SuggestedTimeouts,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            radio_peer_idle_timeout: Duration::from_secs(60),
            local_network_idle_timeout: Duration::from_secs(60),
            minimum_update_window: Duration::from_millis(500),
            capacity_per_kind: 100,
            suggested_timeouts: SuggestedTimeouts::default(),
        }
    }
}

impl TrackerConfig {
    /// Age after which an unchanged beacon generation counts as a new one.
    pub fn beacon_rollover_window(&self) -> Duration {
        Generation::rollover_window(self.minimum_update_window)
    }
}
