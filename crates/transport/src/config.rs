use std::time::Duration;

use vicinity_net_mux::MuxConfig;
use vicinity_net_peers::TrackerConfig;
use vicinity_net_peers::events::DEFAULT_CHANNEL_CAPACITY;

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub tracker: TrackerConfig,
    pub mux: MuxConfig,
    /// How often idle peers are swept from the cache.
    pub watcher_interval: Duration,
    /// Buffered events per subscriber before a slow one starts missing events.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            mux: MuxConfig::default(),
            watcher_interval: Duration::from_secs(1),
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
