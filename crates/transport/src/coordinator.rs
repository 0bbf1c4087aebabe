//! The coordinator and the lifecycle operations it queues.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use strum::Display;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vicinity_net_bridge::{
    BridgeEventReceiver, ConnectionRouter, DiscoveryAdvertisingState, NativeBridge,
};
use vicinity_net_mux::{ConnectionMultiplexer, IncomingConnectionId, mux_channel};
use vicinity_net_peers::{AvailabilityEvent, EventEmitter, HostInfoResolution, PeerAvailabilityTracker};
use vicinity_net_primitives::{LOOPBACK, NetworkStatus, PeerHostInfo, PeerIdentifier, TransportKind};
use vicinity_tasks::OperationQueue;

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::event::CoordinatorEvent;
use crate::{driver, listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CoordinatorLifecycle {
    Initialized,
    Started,
    Stopped,
}

/// Everything one start/stop cycle owns.
pub(crate) struct Running {
    pub(crate) cycle: u64,
    pub(crate) mux: Arc<ConnectionMultiplexer>,
    pub(crate) native_port: u16,
    pub(crate) app_port: u16,
    app_listener: JoinHandle<()>,
    mux_events: JoinHandle<()>,
    pub(crate) fatal_reported: bool,
}

impl Running {
    fn shutdown(self) {
        self.mux.stop();
        self.app_listener.abort();
        self.mux_events.abort();
    }
}

pub(crate) struct State {
    pub(crate) lifecycle: CoordinatorLifecycle,
    next_cycle: u64,
    pub(crate) running: Option<Running>,
    /// Discovery and advertising as last requested by the application.
    pub(crate) requested: DiscoveryAdvertisingState,
    pub(crate) last_reported: Option<DiscoveryAdvertisingState>,
    /// Kind of every peer given a listener, to map multiplexer events back to the cache.
    pub(crate) listener_kinds: HashMap<PeerIdentifier, TransportKind>,
}

pub(crate) struct Inner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) bridge: Arc<dyn NativeBridge>,
    /// Totally orders lifecycle and native control calls.
    pub(crate) control: OperationQueue,
    /// Processes peer notifications one at a time, independent of `control`.
    pub(crate) peer_queue: OperationQueue,
    pub(crate) state: Mutex<State>,
    pub(crate) tracker: Mutex<PeerAvailabilityTracker>,
    pub(crate) events: EventEmitter<CoordinatorEvent>,
    pub(crate) network: watch::Sender<Option<NetworkStatus>>,
}

impl Inner {
    /// Cycle number while started.
    pub(crate) fn started_cycle(&self) -> Option<u64> {
        let state = self.state.lock();
        match (&state.lifecycle, &state.running) {
            (CoordinatorLifecycle::Started, Some(running)) => Some(running.cycle),
            _ => None,
        }
    }

    /// The multiplexer of `cycle`, if that cycle is still running.
    pub(crate) fn mux_for(&self, cycle: u64) -> Option<Arc<ConnectionMultiplexer>> {
        let state = self.state.lock();
        state
            .running
            .as_ref()
            .filter(|running| running.cycle == cycle)
            .map(|running| Arc::clone(&running.mux))
    }

    fn current_mux(&self) -> Result<Arc<ConnectionMultiplexer>, CoordinatorError> {
        let state = self.state.lock();
        state
            .running
            .as_ref()
            .map(|running| Arc::clone(&running.mux))
            .ok_or(CoordinatorError::NotStarted)
    }

    fn native_port(&self) -> Result<u16, CoordinatorError> {
        let state = self.state.lock();
        state
            .running
            .as_ref()
            .map(|running| running.native_port)
            .ok_or(CoordinatorError::NotStarted)
    }

    /// Runs `work` after every peer notification queued so far.
    pub(crate) fn on_peer_queue<Fut>(&self, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        drop(self.peer_queue.enqueue(move || async move {
            work.await;
            Ok::<_, Infallible>(())
        }));
    }

    /// Emits tracker output, closing the listener of every peer that went away.
    pub(crate) fn publish(&self, events: Vec<AvailabilityEvent>) {
        for event in events {
            match &event {
                AvailabilityEvent::CacheOverflow {
                    peer_identifier,
                    transport_kind,
                } => {
                    warn!(peer = %peer_identifier, kind = %transport_kind, "peer cache full, possible flooding");
                }
                AvailabilityEvent::Changed(change) if !change.peer_available => {
                    self.retire_listener(&change.peer_identifier, change.transport_kind);
                }
                AvailabilityEvent::Changed(_) => {}
            }
            self.events.emit(event.into());
        }
    }

    fn retire_listener(&self, peer: &PeerIdentifier, kind: TransportKind) {
        let mux = {
            let mut state = self.state.lock();
            if state.listener_kinds.get(peer) != Some(&kind) {
                return;
            }
            state.listener_kinds.remove(peer);
            state.running.as_ref().map(|running| Arc::clone(&running.mux))
        };
        let Some(mux) = mux else { return };
        let Some(port) = mux.peer_listener_port(peer) else {
            return;
        };
        let peer = peer.clone();
        self.on_peer_queue(async move {
            mux.terminate_outgoing_connection(&peer, port).await;
        });
    }

    async fn start(self: Arc<Self>, router: Arc<dyn ConnectionRouter>) -> Result<(), CoordinatorError> {
        let lifecycle = self.state.lock().lifecycle;
        if lifecycle == CoordinatorLifecycle::Started {
            return Err(CoordinatorError::AlreadyStarted);
        }
        router.check().map_err(CoordinatorError::BadRouter)?;

        let app_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let app_port = app_listener.local_addr()?.port();
        let (mux_tx, mux_rx) = mux_channel();
        let mux = Arc::new(ConnectionMultiplexer::new(
            Arc::clone(&self.bridge),
            app_port,
            self.config.mux.clone(),
            mux_tx,
        ));
        let native_port = mux.start().await?;

        let mut state = self.state.lock();
        state.next_cycle += 1;
        let cycle = state.next_cycle;
        state.running = Some(Running {
            cycle,
            mux,
            native_port,
            app_port,
            app_listener: tokio::spawn(listener::run_app_listener(app_listener, router)),
            mux_events: tokio::spawn(driver::drain_mux_events(Arc::clone(&self), cycle, mux_rx)),
            fatal_reported: false,
        });
        state.lifecycle = CoordinatorLifecycle::Started;
        state.requested = DiscoveryAdvertisingState::default();
        state.last_reported = None;
        // Host info lookups bypass the control queue and may land after a stop.
        state.listener_kinds.clear();
        metrics::counter!("transport.cycles_started_total").increment(1);
        info!(cycle, app_port, native_port, "coordinator started");
        Ok(())
    }

    pub(crate) async fn stop(self: Arc<Self>) -> Result<(), CoordinatorError> {
        let running = {
            let mut state = self.state.lock();
            if state.lifecycle != CoordinatorLifecycle::Started {
                return Ok(());
            }
            state.lifecycle = CoordinatorLifecycle::Stopped;
            state.requested = DiscoveryAdvertisingState::default();
            state.last_reported = None;
            state.listener_kinds.clear();
            state.running.take()
        };

        let mut errors = Vec::new();
        if let Err(error) = self.bridge.stop_advertising_and_listening().await {
            errors.push(error.to_string());
        }
        if let Err(error) = self.bridge.stop_listening_for_advertisements().await {
            errors.push(error.to_string());
        }
        if let Some(running) = running {
            info!(cycle = running.cycle, "coordinator stopping");
            running.shutdown();
        }

        let evicted = self.tracker.lock().clear();
        self.publish(evicted);

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(?errors, "coordinator stopped with errors");
            Err(CoordinatorError::Stop(errors))
        }
    }

    /// Tears everything down without talking to the bridge.
    fn shutdown_now(&self) {
        let running = {
            let mut state = self.state.lock();
            if state.lifecycle == CoordinatorLifecycle::Started {
                state.lifecycle = CoordinatorLifecycle::Stopped;
            }
            state.listener_kinds.clear();
            state.running.take()
        };
        if let Some(running) = running {
            running.shutdown();
        }
    }

    fn ensure_started(&self) -> Result<(), CoordinatorError> {
        match self.state.lock().lifecycle {
            CoordinatorLifecycle::Started => Ok(()),
            _ => Err(CoordinatorError::NotStarted),
        }
    }

    fn request(&self, update: impl FnOnce(&mut DiscoveryAdvertisingState)) {
        let mut state = self.state.lock();
        if state.lifecycle == CoordinatorLifecycle::Started {
            update(&mut state.requested);
        }
    }

    async fn start_listening(self: Arc<Self>) -> Result<(), CoordinatorError> {
        self.ensure_started()?;
        self.bridge.start_listening_for_advertisements().await?;
        self.request(|requested| requested.discovery_active = true);
        Ok(())
    }

    async fn stop_listening(self: Arc<Self>) -> Result<(), CoordinatorError> {
        self.ensure_started()?;
        self.bridge.stop_listening_for_advertisements().await?;
        self.request(|requested| requested.discovery_active = false);
        Ok(())
    }

    async fn start_advertising(self: Arc<Self>) -> Result<(), CoordinatorError> {
        let port = self.native_port()?;
        self.bridge.start_update_advertising_and_listening(port).await?;
        self.request(|requested| requested.advertising_active = true);
        Ok(())
    }

    async fn stop_advertising(self: Arc<Self>) -> Result<(), CoordinatorError> {
        self.ensure_started()?;
        self.bridge.stop_advertising_and_listening().await?;
        self.request(|requested| requested.advertising_active = false);
        Ok(())
    }

    async fn kill_connections(self: Arc<Self>) -> Result<(), CoordinatorError> {
        self.ensure_started()?;
        self.bridge.kill_connections().await?;
        Ok(())
    }

    /// Asks for discovery and advertising again after a radio came back.
    pub(crate) async fn reissue_requested(self: Arc<Self>, cycle: u64) -> Result<(), CoordinatorError> {
        let requested = {
            let state = self.state.lock();
            match &state.running {
                Some(running) if running.cycle == cycle => state.requested,
                _ => return Ok(()),
            }
        };
        if requested.discovery_active {
            if let Err(error) = self.bridge.start_listening_for_advertisements().await {
                warn!(%error, "could not restart discovery after radio came back");
            }
        }
        if requested.advertising_active {
            let port = self.native_port()?;
            if let Err(error) = self.bridge.start_update_advertising_and_listening(port).await {
                warn!(%error, "could not restart advertising after radio came back");
            }
        }
        Ok(())
    }

    async fn terminate_incoming(self: Arc<Self>, id: IncomingConnectionId) -> Result<(), CoordinatorError> {
        if let Ok(mux) = self.current_mux() {
            mux.terminate_incoming_connection(id);
        }
        Ok(())
    }

    async fn terminate_outgoing(
        self: Arc<Self>,
        peer: PeerIdentifier,
        port: u16,
    ) -> Result<(), CoordinatorError> {
        let Ok(mux) = self.current_mux() else {
            return Ok(());
        };
        mux.terminate_outgoing_connection(&peer, port).await;
        if mux.peer_listener_port(&peer).is_none() {
            self.state.lock().listener_kinds.remove(&peer);
        }
        Ok(())
    }
}

/// Owns the native bridge on behalf of the application.
///
/// Every control method goes through one [`OperationQueue`], so concurrent callers are
/// served strictly one after another and the bridge never sees two control calls at
/// once. Bridge and multiplexer notifications are drained by a background task; peer
/// notifications are handled one at a time on a second queue.
pub struct TransportCoordinator {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl std::fmt::Debug for TransportCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCoordinator")
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl TransportCoordinator {
    /// Creates the coordinator and starts draining `bridge_events`. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        bridge: Arc<dyn NativeBridge>,
        bridge_events: BridgeEventReceiver,
        config: CoordinatorConfig,
    ) -> Self {
        let (network, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            tracker: Mutex::new(PeerAvailabilityTracker::new(config.tracker.clone())),
            events: EventEmitter::new(config.event_capacity),
            config,
            bridge,
            control: OperationQueue::new("transport.control"),
            peer_queue: OperationQueue::new("transport.peers"),
            state: Mutex::new(State {
                lifecycle: CoordinatorLifecycle::Initialized,
                next_cycle: 0,
                running: None,
                requested: DiscoveryAdvertisingState::default(),
                last_reported: None,
                listener_kinds: HashMap::new(),
            }),
            network,
        });
        let driver = tokio::spawn(driver::run(Arc::clone(&inner), bridge_events));
        Self { inner, driver }
    }

    pub fn lifecycle(&self) -> CoordinatorLifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Port the router is served on, while started.
    pub fn app_listener_port(&self) -> Option<u16> {
        self.inner.state.lock().running.as_ref().map(|r| r.app_port)
    }

    /// Port the native stack pushes inbound sessions to, while started.
    pub fn native_listener_port(&self) -> Option<u16> {
        self.inner.state.lock().running.as_ref().map(|r| r.native_port)
    }

    pub fn is_peer_available(&self, peer: &str, kind: TransportKind) -> bool {
        self.inner.tracker.lock().contains(peer, kind)
    }

    /// Serves `router` on a fresh loopback listener and starts the multiplexer in front
    /// of it.
    ///
    /// Fails with [`CoordinatorError::AlreadyStarted`] unless initialized or stopped,
    /// and with [`CoordinatorError::BadRouter`] if the router refuses its check.
    pub async fn start<R>(&self, router: R) -> Result<(), CoordinatorError>
    where
        R: ConnectionRouter + 'static,
    {
        let router: Arc<dyn ConnectionRouter> = Arc::new(router);
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.start(router)).await?)
    }

    /// Stops advertising and discovery, closes every listener and session and forgets
    /// every peer. Idempotent; does nothing before the first start.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.stop()).await?)
    }

    pub async fn start_listening_for_advertisements(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.start_listening()).await?)
    }

    pub async fn stop_listening_for_advertisements(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.stop_listening()).await?)
    }

    /// Advertises this device; remote sessions land on the multiplexer's native port.
    pub async fn start_update_advertising_and_listening(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.start_advertising()).await?)
    }

    pub async fn stop_advertising_and_listening(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.stop_advertising()).await?)
    }

    pub async fn kill_connections(&self) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.kill_connections()).await?)
    }

    /// Closes one inbound session. Unknown sessions are not an error.
    pub async fn terminate_incoming_connection(
        &self,
        id: IncomingConnectionId,
    ) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.control.enqueue(move || inner.terminate_incoming(id)).await?)
    }

    /// Closes the listener for `peer` on `port`. Unknown listeners are not an error.
    pub async fn terminate_outgoing_connection(
        &self,
        peer: &PeerIdentifier,
        port: u16,
    ) -> Result<(), CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        let peer = peer.clone();
        Ok(self
            .inner
            .control
            .enqueue(move || inner.terminate_outgoing(peer, port))
            .await?)
    }

    /// Latest status reported by the native stack. Waits for the first report, also
    /// before start.
    pub async fn get_network_status(&self) -> NetworkStatus {
        let mut rx = self.inner.network.subscribe();
        loop {
            if let Some(status) = rx.borrow_and_update().clone() {
                return status;
            }
            if rx.changed().await.is_err() {
                return NetworkStatus::default();
            }
        }
    }

    /// Where the application should connect to reach `peer` over `kind`.
    ///
    /// Multipeer peers get a native session opened first; its failure is returned here
    /// and also reported as [`CoordinatorEvent::FailedConnection`].
    pub async fn get_peer_host_info(
        &self,
        peer: &PeerIdentifier,
        kind: TransportKind,
    ) -> Result<PeerHostInfo, CoordinatorError> {
        let resolution = self.inner.tracker.lock().host_info(peer, kind)?;
        match resolution {
            HostInfoResolution::Ready(info) => Ok(info),
            HostInfoResolution::ResolveThroughMux {
                suggested_tcp_timeout,
            } => {
                let mux = self.inner.current_mux()?;
                self.inner
                    .state
                    .lock()
                    .listener_kinds
                    .insert(peer.clone(), kind);
                let port_number = mux.connect_on_demand(peer).await?;
                debug!(%peer, %kind, port_number, "peer reachable through multiplexer");
                Ok(PeerHostInfo {
                    host_address: LOOPBACK,
                    port_number,
                    suggested_tcp_timeout,
                })
            }
        }
    }
}

impl Drop for TransportCoordinator {
    fn drop(&mut self) {
        self.driver.abort();
        self.inner.shutdown_now();
    }
}
