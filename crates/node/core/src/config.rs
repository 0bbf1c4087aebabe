//! Node configuration file.
//!
//! Every section is optional; missing keys take the component defaults. Durations are
//! given in milliseconds.
//!
//! ```toml
//! [tracker]
//! radio_peer_idle_timeout_ms = 60000
//! capacity_per_kind = 100
//!
//! [tracker.suggested_tcp_timeout_ms]
//! local_network = 5000
//!
//! [mux]
//! session_idle_timeout_ms = 30000
//!
//! [coordinator]
//! watcher_interval_ms = 1000
//!
//! [log]
//! verbosity = 1
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use eyre::{Result, WrapErr, ensure};
use serde::{Deserialize, Serialize};
use vicinity_net_mux::MuxConfig;
use vicinity_net_peers::{SuggestedTimeouts, TrackerConfig};
use vicinity_transport::CoordinatorConfig;

use crate::logging::LogConfig;

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub tracker: TrackerSection,
    pub mux: MuxSection,
    pub coordinator: CoordinatorSection,
    pub log: LogConfig,
}

/// Peer availability tracker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerSection {
    pub radio_peer_idle_timeout_ms: u64,
    pub local_network_idle_timeout_ms: u64,
    pub minimum_update_window_ms: u64,
    pub capacity_per_kind: usize,
    pub suggested_tcp_timeout_ms: SuggestedTimeoutSection,
}

/// TCP timeout suggested to the application, per transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuggestedTimeoutSection {
    pub radio: u64,
    pub multipeer: u64,
    pub local_network: u64,
}

/// Connection multiplexer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuxSection {
    pub session_idle_timeout_ms: u64,
    pub relay_buffer_size: usize,
}

/// Transport coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorSection {
    pub watcher_interval_ms: u64,
    pub event_capacity: usize,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for TrackerSection {
    fn default() -> Self {
        let defaults = TrackerConfig::default();
        Self {
            radio_peer_idle_timeout_ms: millis(defaults.radio_peer_idle_timeout),
            local_network_idle_timeout_ms: millis(defaults.local_network_idle_timeout),
            minimum_update_window_ms: millis(defaults.minimum_update_window),
            capacity_per_kind: defaults.capacity_per_kind,
            suggested_tcp_timeout_ms: SuggestedTimeoutSection::default(),
        }
    }
}

impl Default for SuggestedTimeoutSection {
    fn default() -> Self {
        let defaults = SuggestedTimeouts::default();
        Self {
            radio: millis(defaults.radio),
            multipeer: millis(defaults.multipeer),
            local_network: millis(defaults.local_network),
        }
    }
}

impl Default for MuxSection {
    fn default() -> Self {
        let defaults = MuxConfig::default();
        Self {
            session_idle_timeout_ms: millis(defaults.session_idle_timeout),
            relay_buffer_size: defaults.relay_buffer_size,
        }
    }
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            watcher_interval_ms: millis(defaults.watcher_interval),
            event_capacity: defaults.event_capacity,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration file at `path`. A missing file, or no path at all,
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path.filter(|path| path.exists()) else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .wrap_err_with(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).wrap_err("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to the given path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Rejects values the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.tracker.capacity_per_kind > 0,
            "tracker.capacity_per_kind must be at least 1"
        );
        ensure!(
            self.mux.relay_buffer_size > 0,
            "mux.relay_buffer_size must be at least 1"
        );
        ensure!(
            self.coordinator.watcher_interval_ms > 0,
            "coordinator.watcher_interval_ms must be positive"
        );
        ensure!(
            self.coordinator.event_capacity > 0,
            "coordinator.event_capacity must be at least 1"
        );
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let tracker = &self.tracker;
        let timeouts = &tracker.suggested_tcp_timeout_ms;
        TrackerConfig {
            radio_peer_idle_timeout: Duration::from_millis(tracker.radio_peer_idle_timeout_ms),
            local_network_idle_timeout: Duration::from_millis(
                tracker.local_network_idle_timeout_ms,
            ),
            minimum_update_window: Duration::from_millis(tracker.minimum_update_window_ms),
            capacity_per_kind: tracker.capacity_per_kind,
            suggested_timeouts: SuggestedTimeouts {
                radio: Duration::from_millis(timeouts.radio),
                multipeer: Duration::from_millis(timeouts.multipeer),
                local_network: Duration::from_millis(timeouts.local_network),
            },
        }
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            session_idle_timeout: Duration::from_millis(self.mux.session_idle_timeout_ms),
            relay_buffer_size: self.mux.relay_buffer_size,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tracker: self.tracker_config(),
            mux: self.mux_config(),
            watcher_interval: Duration::from_millis(self.coordinator.watcher_interval_ms),
            event_capacity: self.coordinator.event_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_matches_component_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.coordinator_config(), CoordinatorConfig::default());
        assert_eq!(config.tracker.radio_peer_idle_timeout_ms, 60_000);
        assert_eq!(config.tracker.suggested_tcp_timeout_ms.local_network, 5_000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
[tracker]
capacity_per_kind = 10

[tracker.suggested_tcp_timeout_ms]
radio = 2500

[coordinator]
watcher_interval_ms = 250
"#,
        )
        .unwrap();

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.tracker.capacity_per_kind, 10);
        assert_eq!(
            coordinator.tracker.suggested_timeouts.radio,
            Duration::from_millis(2500)
        );
        assert_eq!(
            coordinator.tracker.suggested_timeouts.multipeer,
            Duration::from_secs(10)
        );
        assert_eq!(coordinator.watcher_interval, Duration::from_millis(250));
        assert_eq!(coordinator.mux, MuxConfig::default());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(NodeConfig::from_toml_str("[mux]\nsession_idle_timeout = 5\n").is_err());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let error = NodeConfig::from_toml_str("[coordinator]\nevent_capacity = 0\n").unwrap_err();
        assert!(error.to_string().contains("event_capacity"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        assert_eq!(NodeConfig::load(Some(&config_path)).unwrap(), NodeConfig::default());
        assert_eq!(NodeConfig::load(None).unwrap(), NodeConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("vicinity.toml");

        let mut config = NodeConfig::default();
        config.mux.session_idle_timeout_ms = 1_500;
        config.log.verbosity = 2;
        config.save(&config_path).unwrap();

        assert_eq!(NodeConfig::load(Some(&config_path)).unwrap(), config);
    }
}
