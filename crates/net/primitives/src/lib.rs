//! Value types shared by the vicinity transport crates.
//!
//! Everything here is plain data: peer identifiers, the transport kinds a peer can be
//! discovered over, wrapping generation counters and radio status snapshots.

use std::borrow::Borrow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Address every virtualised peer is reached on.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Opaque name of a remote device, as reported by the transport that found it.
///
/// Not unique across transports: the same identifier seen on two transport kinds is
/// tracked as two peers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentifier(Arc<str>);

impl PeerIdentifier {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentifier {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerIdentifier {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for PeerIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerIdentifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Discovery and connection mechanism a peer was seen on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Classic short-range radio sessions (RFCOMM style sockets).
    RadioClassic,
    /// Low-energy beacon discovery; sessions ride on the classic radio.
    RadioBeacon,
    /// Platform peer-connectivity framework.
    MultipeerFramework,
    /// Local network discovery with real IP addresses.
    LocalNetwork,
}

impl TransportKind {
    pub const ALL: [Self; 4] = [
        Self::RadioClassic,
        Self::RadioBeacon,
        Self::MultipeerFramework,
        Self::LocalNetwork,
    ];

    /// Radio kinds never report a peer as gone.
    pub const fn is_radio(&self) -> bool {
        matches!(self, Self::RadioClassic | Self::RadioBeacon)
    }

    /// Whether peers of this kind are only reachable through a local virtual listener.
    pub const fn is_virtualised(&self) -> bool {
        !matches!(self, Self::LocalNetwork)
    }
}

/// Number of distinct values a generation can take before it wraps.
pub const GENERATION_ROLLOVER_STEPS: u32 = 255;

/// Advertisement counter reported by a transport.
///
/// One byte wide and wrapping, so ordering uses serial-number arithmetic: a value
/// is newer than another when it is ahead by less than half the range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u8);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Generation {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The generation that follows this one, wrapping after 255.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub const fn is_newer_than(self, other: Self) -> bool {
        let ahead = self.0.wrapping_sub(other.0);
        ahead != 0 && ahead < 128
    }

    /// Time after which an unchanged generation may have wrapped all the way round.
    ///
    /// Transports bump the generation at most once per `minimum_update_window`.
    pub fn rollover_window(minimum_update_window: Duration) -> Duration {
        minimum_update_window.saturating_mul(GENERATION_ROLLOVER_STEPS)
    }
}

impl From<u8> for Generation {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// State of one radio as reported by the platform.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum RadioState {
    On,
    Off,
    /// Present but not usable, e.g. no permission.
    #[default]
    Unavailable,
    /// The device has no such radio.
    NotHere,
    /// Not relevant to discovery (cellular).
    DoNotCare,
}

impl RadioState {
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }

    pub const fn is_off(self) -> bool {
        matches!(self, Self::Off)
    }
}

/// Snapshot of the radios relevant to discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub radio_classic: RadioState,
    pub radio_low_energy: RadioState,
    /// Local network interface (wifi).
    pub network: RadioState,
    pub cellular: RadioState,
    /// Access point identifier when connected to a local network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid_name: Option<String>,
}

impl NetworkStatus {
    /// Transport kinds whose peers can no longer be reached in this state.
    ///
    /// Switching off either radio half takes both radio kinds down. The multipeer
    /// framework survives on whichever of the classic radio, the low-energy radio and
    /// the network is left, so it goes only once the classic radio and one of the
    /// others are off.
    pub fn unreachable_kinds(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        let classic_off = self.radio_classic.is_off();
        if classic_off || self.radio_low_energy.is_off() {
            kinds.push(TransportKind::RadioClassic);
            kinds.push(TransportKind::RadioBeacon);
        }
        if classic_off && (self.radio_low_energy.is_off() || self.network.is_off()) {
            kinds.push(TransportKind::MultipeerFramework);
        }
        if self.network.is_off() {
            kinds.push(TransportKind::LocalNetwork);
        }
        kinds
    }

    fn radios(&self) -> [RadioState; 4] {
        [
            self.radio_classic,
            self.radio_low_energy,
            self.network,
            self.cellular,
        ]
    }

    /// Whether at least one radio is switched on.
    pub fn any_radio_on(&self) -> bool {
        self.radios().into_iter().any(RadioState::is_on)
    }

    /// Whether some radio is on now that was not on in `previous`. With no previous
    /// status every radio that is on counts.
    pub fn radio_turned_on_since(&self, previous: Option<&Self>) -> bool {
        let before = previous.map(Self::radios);
        self.radios().into_iter().enumerate().any(|(index, state)| {
            state.is_on()
                && !before
                    .and_then(|before| before.get(index).copied())
                    .is_some_and(RadioState::is_on)
        })
    }
}

/// Where the application should connect to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHostInfo {
    pub host_address: IpAddr,
    pub port_number: u16,
    /// Connect timeout appropriate for the transport carrying the connection.
    pub suggested_tcp_timeout: Duration,
}
