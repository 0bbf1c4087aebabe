use metrics::{Counter, Gauge};
use vicinity_net_primitives::TransportKind;

/// Per-transport cache metrics.
#[derive(Clone, Debug)]
pub(crate) struct TrackerMetrics {
    cached: [Gauge; 4],
    overflow_total: [Counter; 4],
}

impl TrackerMetrics {
    pub(crate) fn new() -> Self {
        Self {
            cached: TransportKind::ALL.map(|kind| {
                metrics::gauge!("peer_availability.cached_peers", "kind" => kind.to_string())
            }),
            overflow_total: TransportKind::ALL.map(|kind| {
                metrics::counter!("peer_availability.cache_overflow_total", "kind" => kind.to_string())
            }),
        }
    }

    pub(crate) fn set_cached(&self, kind: TransportKind, count: usize) {
        if let Some(gauge) = self.cached.get(index(kind)) {
            gauge.set(count as f64);
        }
    }

    pub(crate) fn inc_overflow(&self, kind: TransportKind) {
        if let Some(counter) = self.overflow_total.get(index(kind)) {
            counter.increment(1);
        }
    }
}

const fn index(kind: TransportKind) -> usize {
    match kind {
        TransportKind::RadioClassic => 0,
        TransportKind::RadioBeacon => 1,
        TransportKind::MultipeerFramework => 2,
        TransportKind::LocalNetwork => 3,
    }
}
