//! Background handling of bridge and multiplexer notifications.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use vicinity_net_bridge::{
    BridgeEvent, BridgeEventReceiver, DiscoveryAdvertisingState, LocalNetworkPeer, NativePeer,
};
use vicinity_net_mux::{MuxEvent, MuxEventReceiver};
use vicinity_net_peers::{AvailabilityEvent, PeerAvailabilityChanged, PeerNotification};
use vicinity_net_primitives::{NetworkStatus, PeerIdentifier, TransportKind};

use crate::coordinator::Inner;
use crate::event::{CoordinatorEvent, ListenerFailure};

/// Current instant on the tokio clock, so paused-time tests drive idle expiry.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Drains the bridge feed and sweeps idle peers until the coordinator is dropped.
pub(crate) async fn run(inner: Arc<Inner>, mut bridge_events: BridgeEventReceiver) {
    let mut watcher = tokio::time::interval(inner.config.watcher_interval);
    watcher.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut bridge_open = true;
    loop {
        tokio::select! {
            event = bridge_events.recv(), if bridge_open => match event {
                Some(event) => inner.handle_bridge_event(event),
                None => {
                    debug!("native bridge feed closed");
                    bridge_open = false;
                }
            },
            _ = watcher.tick() => inner.expire_idle_peers(),
        }
    }
}

/// Drains the multiplexer of one start/stop cycle.
pub(crate) async fn drain_mux_events(inner: Arc<Inner>, cycle: u64, mut events: MuxEventReceiver) {
    while let Some(event) = events.recv().await {
        inner.handle_mux_event(cycle, event);
    }
}

impl Inner {
    fn handle_bridge_event(self: &Arc<Self>, event: BridgeEvent) {
        match event {
            BridgeEvent::PeerAvailabilityChanged(peers) => {
                let Some(cycle) = self.started_cycle() else {
                    debug!(count = peers.len(), "ignoring peer availability while not started");
                    return;
                };
                for peer in peers {
                    let inner = Arc::clone(self);
                    self.on_peer_queue(async move { inner.process_native_peer(cycle, peer).await });
                }
            }
            BridgeEvent::LocalNetworkPeer(peer) => {
                let Some(cycle) = self.started_cycle() else {
                    debug!(peer = %peer.peer_identifier, "ignoring local network peer while not started");
                    return;
                };
                let inner = Arc::clone(self);
                self.on_peer_queue(async move { inner.process_local_network_peer(cycle, peer) });
            }
            BridgeEvent::LocalNetworkDiscoveryStopped => {
                self.reset_kinds(vec![TransportKind::LocalNetwork]);
            }
            BridgeEvent::NetworkChanged(status) => self.on_network_changed(status),
            BridgeEvent::DiscoveryAdvertisingState(reported) => {
                self.on_discovery_advertising_state(reported);
            }
            BridgeEvent::IncomingConnectionToPortNumberFailed { port } => {
                let native_port = {
                    let state = self.state.lock();
                    state.running.as_ref().map(|running| (running.cycle, running.native_port))
                };
                match native_port {
                    Some((cycle, native_port)) if native_port == port => {
                        self.fail_fatally(cycle, ListenerFailure::NativeListener, port, Vec::new());
                    }
                    Some((_, native_port)) => {
                        info!(port, native_port, "listener failure for a port we do not own");
                    }
                    None => info!(port, "listener failure while not started"),
                }
            }
        }
    }

    fn handle_mux_event(self: &Arc<Self>, cycle: u64, event: MuxEvent) {
        match event {
            MuxEvent::RouterPortConnectionFailed { router_port, error } => {
                let app_port = {
                    let state = self.state.lock();
                    state
                        .running
                        .as_ref()
                        .filter(|running| running.cycle == cycle)
                        .map(|running| running.app_port)
                };
                match app_port {
                    Some(app_port) if app_port == router_port => {
                        self.fail_fatally(cycle, ListenerFailure::AppListener, router_port, vec![error]);
                    }
                    _ => info!(router_port, "router failure from a previous cycle"),
                }
            }
            MuxEvent::FailedConnection {
                peer_identifier,
                error,
            } => self.on_failed_connection(cycle, peer_identifier, error),
            MuxEvent::IncomingConnectionState {
                incoming_connection_id,
                state,
            } => {
                if self.started_cycle() == Some(cycle) {
                    self.events.emit(CoordinatorEvent::IncomingConnectionState {
                        incoming_connection_id,
                        state,
                    });
                }
            }
            MuxEvent::ListenerRecreatedAfterFailure {
                peer_identifier,
                port_number,
            } => {
                let inner = Arc::clone(self);
                self.on_peer_queue(async move {
                    inner.on_listener_recreated(cycle, peer_identifier, port_number);
                });
            }
        }
    }

    /// Stops at top priority and reports `reason`, at most once per start.
    fn fail_fatally(self: &Arc<Self>, cycle: u64, reason: ListenerFailure, port: u16, mut errors: Vec<String>) {
        {
            let mut state = self.state.lock();
            let Some(running) = state.running.as_mut().filter(|running| running.cycle == cycle) else {
                return;
            };
            if running.fatal_reported {
                return;
            }
            running.fatal_reported = true;
        }
        warn!(%reason, port, ?errors, "listener failed, stopping");
        metrics::counter!("transport.listener_failures_total", "reason" => reason.to_string())
            .increment(1);

        let stop = {
            let inner = Arc::clone(self);
            self.control.enqueue_at_top(move || inner.stop())
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = stop.await {
                errors.extend(crate::CoordinatorError::from(error).into_messages());
            }
            inner
                .events
                .emit(CoordinatorEvent::IncomingConnectionToPortNumberFailed { reason, errors, port });
        });
    }

    async fn process_native_peer(self: Arc<Self>, cycle: u64, peer: NativePeer) {
        let Some(mux) = self.mux_for(cycle) else {
            trace!(peer = %peer.peer_identifier, "dropping peer notification from a stopped cycle");
            return;
        };
        let kind = peer.transport_kind;
        let id = peer.peer_identifier;
        let mut notification = if peer.available {
            PeerNotification::available(id.clone(), kind)
        } else {
            PeerNotification::unavailable(id.clone(), kind)
        };
        if let Some(generation) = peer.generation {
            notification = notification.with_generation(generation);
        }

        let mut created_port = None;
        match kind {
            TransportKind::RadioClassic | TransportKind::RadioBeacon if peer.available => {
                // A full cache gets neither a listener nor a native connect.
                let overflow = self.tracker.lock().check_capacity(&id, kind);
                if let Some(overflow) = overflow {
                    self.publish(vec![overflow]);
                    return;
                }
                match mux.create_peer_listener(&id, peer.please_connect).await {
                    Ok(port) => {
                        self.state.lock().listener_kinds.insert(id.clone(), kind);
                        notification = notification.with_port(port);
                        created_port = Some(port);
                    }
                    Err(error) => {
                        warn!(peer = %id, %kind, %error, "could not create peer listener, treating peer as gone");
                        notification = PeerNotification::unavailable(id.clone(), kind);
                    }
                }
            }
            TransportKind::LocalNetwork => {
                warn!(peer = %id, "local network peer on the native feed, ignoring");
                return;
            }
            _ => {}
        }

        if self.mux_for(cycle).is_none() {
            trace!(peer = %id, "stopped while handling peer, discarding");
            return;
        }
        let events = self.tracker.lock().handle_notification(notification, now());
        let rejected = events.iter().any(|event| {
            matches!(
                event,
                AvailabilityEvent::CacheOverflow { peer_identifier, .. } if *peer_identifier == id
            )
        });
        if let (true, Some(port)) = (rejected, created_port) {
            self.state.lock().listener_kinds.remove(&id);
            mux.terminate_outgoing_connection(&id, port).await;
        }
        self.publish(events);
    }

    fn process_local_network_peer(&self, cycle: u64, peer: LocalNetworkPeer) {
        if self.started_cycle() != Some(cycle) {
            return;
        }
        let kind = TransportKind::LocalNetwork;
        let mut notification = match (peer.host_address, peer.port_number) {
            (Some(host), Some(port)) => {
                PeerNotification::available(peer.peer_identifier, kind).with_address(host, port)
            }
            _ => PeerNotification::unavailable(peer.peer_identifier, kind),
        };
        if let Some(generation) = peer.generation {
            notification = notification.with_generation(generation);
        }
        let events = self.tracker.lock().handle_notification(notification, now());
        self.publish(events);
    }

    fn on_failed_connection(self: &Arc<Self>, cycle: u64, peer: PeerIdentifier, error: String) {
        if self.started_cycle() != Some(cycle) {
            return;
        }
        let kind = self.state.lock().listener_kinds.get(&peer).copied();
        debug!(%peer, ?kind, %error, "native connect failed");
        if let Some(kind) = kind {
            let inner = Arc::clone(self);
            let failed = peer.clone();
            self.on_peer_queue(async move {
                if inner.started_cycle() != Some(cycle) {
                    return;
                }
                let events = inner.tracker.lock().handle_failed_connection(&failed, kind, now());
                inner.publish(events);
            });
        }
        self.events.emit(CoordinatorEvent::FailedConnection {
            peer_identifier: peer,
            transport_kind: kind,
            error,
        });
    }

    /// The multiplexer replaced an idle listener; point the application at the new port.
    fn on_listener_recreated(&self, cycle: u64, peer: PeerIdentifier, port: u16) {
        if self.started_cycle() != Some(cycle) {
            return;
        }
        let Some(kind) = self.state.lock().listener_kinds.get(&peer).copied() else {
            trace!(%peer, "recreated listener for a peer we no longer track");
            return;
        };
        let events = {
            let mut tracker = self.tracker.lock();
            let Some(generation) = tracker.get(peer.as_str(), kind).map(|record| record.generation)
            else {
                return;
            };
            if kind.is_radio() {
                tracker.set_session_open(&peer, kind, false, now());
                let mut notification = PeerNotification::available(peer, kind).with_port(port);
                if let Some(generation) = generation {
                    notification = notification.with_generation(generation);
                }
                tracker.handle_notification(notification, now())
            } else {
                vec![AvailabilityEvent::Changed(PeerAvailabilityChanged::available(
                    peer, kind, generation, true,
                ))]
            }
        };
        self.publish(events);
    }

    fn on_network_changed(self: &Arc<Self>, status: NetworkStatus) {
        let previous = self.network.send_replace(Some(status.clone()));
        let radio_came_on = status.radio_turned_on_since(previous.as_ref());
        debug!(?status, radio_came_on, "network changed");

        self.reset_kinds(status.unreachable_kinds());

        let Some(cycle) = self.started_cycle() else {
            return;
        };
        self.events.emit(CoordinatorEvent::NetworkChanged(status));
        if radio_came_on {
            let inner = Arc::clone(self);
            drop(self.control.enqueue(move || inner.reissue_requested(cycle)));
        }
    }

    fn on_discovery_advertising_state(self: &Arc<Self>, reported: DiscoveryAdvertisingState) {
        let changed = {
            let mut state = self.state.lock();
            if state.running.is_none() {
                return;
            }
            if reported != state.requested {
                info!(?reported, requested = ?state.requested, "verify: native discovery/advertising state differs from the requested one");
            }
            let changed = state.last_reported != Some(reported);
            state.last_reported = Some(reported);
            changed
        };
        if changed {
            self.events
                .emit(CoordinatorEvent::DiscoveryAdvertisingStateUpdate(reported));
        }
        if !reported.discovery_active {
            self.reset_kinds(vec![
                TransportKind::RadioClassic,
                TransportKind::RadioBeacon,
                TransportKind::MultipeerFramework,
            ]);
        }
    }

    /// Evicts every peer of `kinds`, after the peer notifications already queued.
    fn reset_kinds(self: &Arc<Self>, kinds: Vec<TransportKind>) {
        if kinds.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        self.on_peer_queue(async move {
            for kind in kinds {
                let events = inner.tracker.lock().handle_transport_reset(kind);
                inner.publish(events);
            }
        });
    }

    fn expire_idle_peers(&self) {
        let events = self.tracker.lock().expire_idle(now());
        if !events.is_empty() {
            debug!(count = events.len(), "idle peers expired");
        }
        self.publish(events);
    }
}
