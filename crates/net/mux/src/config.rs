use std::time::Duration;

/// Multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// A session with no traffic in either direction for this long is torn down.
    pub session_idle_timeout: Duration,
    /// Per-direction relay buffer.
    pub relay_buffer_size: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30),
            relay_buffer_size: 16 * 1024,
        }
    }
}
