use metrics::{Counter, Gauge};

#[derive(Clone, Debug)]
pub(crate) struct MuxMetrics {
    inbound_sessions_total: Counter,
    outbound_sessions_total: Counter,
    idle_closed_total: Counter,
    peer_listeners: Gauge,
}

impl MuxMetrics {
    pub(crate) fn new() -> Self {
        Self {
            inbound_sessions_total: metrics::counter!("mux.sessions_total", "direction" => "inbound"),
            outbound_sessions_total: metrics::counter!("mux.sessions_total", "direction" => "outbound"),
            idle_closed_total: metrics::counter!("mux.sessions_idle_closed_total"),
            peer_listeners: metrics::gauge!("mux.peer_listeners"),
        }
    }

    pub(crate) fn inbound_opened(&self) {
        self.inbound_sessions_total.increment(1);
    }

    pub(crate) fn outbound_opened(&self) {
        self.outbound_sessions_total.increment(1);
    }

    pub(crate) fn idle_closed(&self) {
        self.idle_closed_total.increment(1);
    }

    pub(crate) fn set_peer_listeners(&self, count: usize) {
        self.peer_listeners.set(count as f64);
    }
}
