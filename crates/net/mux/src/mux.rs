//! The connection multiplexer and the state its tasks share.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use strum::Display;
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace};
use vicinity_net_bridge::NativeBridge;
use vicinity_net_primitives::PeerIdentifier;

use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::event::{IncomingConnectionId, IncomingConnectionState, MuxEvent, MuxEventSender};
use crate::metrics::MuxMetrics;
use crate::{inbound, outbound};

/// Loopback port of the native session to a peer, once one is open. Locked across the
/// native connect so concurrent local connections share a single connect.
pub(crate) type NativeSlot = Arc<tokio::sync::Mutex<Option<u16>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MuxLifecycle {
    Initialized,
    Started,
    Stopped,
}

#[derive(Debug)]
struct NativeListener {
    port: u16,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct PeerListener {
    pub(crate) port: u16,
    /// Distinguishes a recreated listener from the one it replaced.
    pub(crate) epoch: u64,
    pub(crate) native: NativeSlot,
    pub(crate) active_sessions: usize,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// Aborts the accept loop and every session it spawned. Returns whether a native
    /// session may still be open.
    pub(crate) fn close(self) -> bool {
        self.task.abort();
        self.native.try_lock().map_or(true, |slot| slot.is_some())
    }
}

#[derive(Debug)]
pub(crate) struct MuxState {
    lifecycle: MuxLifecycle,
    native_listener: Option<NativeListener>,
    pub(crate) incoming: HashMap<IncomingConnectionId, AbortHandle>,
    pub(crate) peers: HashMap<PeerIdentifier, PeerListener>,
    next_epoch: u64,
}

pub(crate) struct Shared {
    pub(crate) config: MuxConfig,
    pub(crate) router_port: u16,
    pub(crate) bridge: Arc<dyn NativeBridge>,
    events: MuxEventSender,
    pub(crate) state: Mutex<MuxState>,
    next_incoming_id: AtomicU64,
    pub(crate) metrics: MuxMetrics,
}

impl Shared {
    pub(crate) fn emit(&self, event: MuxEvent) {
        if self.events.send(event).is_err() {
            trace!("mux event receiver dropped");
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.lock().lifecycle == MuxLifecycle::Started
    }

    pub(crate) fn next_incoming_id(&self) -> IncomingConnectionId {
        IncomingConnectionId(self.next_incoming_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Drops the bookkeeping for an inbound session. Returns false if it was already
    /// gone (terminated from outside).
    pub(crate) fn forget_incoming(&self, id: IncomingConnectionId) -> bool {
        self.state.lock().incoming.remove(&id).is_some()
    }

    fn ensure_started(&self) -> Result<(), MuxError> {
        match self.state.lock().lifecycle {
            MuxLifecycle::Started => Ok(()),
            MuxLifecycle::Initialized => Err(MuxError::NotStarted),
            MuxLifecycle::Stopped => Err(MuxError::Stopped),
        }
    }

    pub(crate) fn existing_listener(&self, peer: &PeerIdentifier) -> Option<(u16, NativeSlot)> {
        let state = self.state.lock();
        let listener = state.peers.get(peer)?;
        Some((listener.port, Arc::clone(&listener.native)))
    }

    /// Whether `peer` is still served by the listener on `port`.
    pub(crate) fn peer_listener_is(&self, peer: &PeerIdentifier, port: u16) -> bool {
        self.state
            .lock()
            .peers
            .get(peer)
            .is_some_and(|listener| listener.port == port)
    }

    /// Registers `listener` for `peer` and starts accepting on it, unless the peer
    /// already has one, in which case the existing one wins.
    pub(crate) fn install_peer_listener(
        self: &Arc<Self>,
        peer: &PeerIdentifier,
        listener: TcpListener,
    ) -> Result<(u16, NativeSlot), MuxError> {
        let port = listener.local_addr()?.port();
        let mut state = self.state.lock();
        match state.lifecycle {
            MuxLifecycle::Started => {}
            MuxLifecycle::Initialized => return Err(MuxError::NotStarted),
            MuxLifecycle::Stopped => return Err(MuxError::Stopped),
        }
        if let Some(existing) = state.peers.get(peer) {
            return Ok((existing.port, Arc::clone(&existing.native)));
        }

        let epoch = state.next_epoch;
        state.next_epoch += 1;
        let native: NativeSlot = Arc::default();
        let task = tokio::spawn(outbound::run_peer_listener(
            Arc::clone(self),
            peer.clone(),
            epoch,
            Arc::clone(&native),
            listener,
        ));
        state.peers.insert(
            peer.clone(),
            PeerListener {
                port,
                epoch,
                native: Arc::clone(&native),
                active_sessions: 0,
                task,
            },
        );
        self.metrics.set_peer_listeners(state.peers.len());
        debug!(%peer, port, epoch, "peer listener created");
        Ok((port, native))
    }

    /// Opens the native session in the background; failures are reported as events.
    pub(crate) fn spawn_native_connect(self: &Arc<Self>, peer: PeerIdentifier, native: NativeSlot) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = outbound::ensure_native(&shared, &peer, &native).await {
                shared.emit(MuxEvent::FailedConnection {
                    peer_identifier: peer,
                    error: error.to_string(),
                });
            }
        });
    }

    pub(crate) fn remove_peer_listener(
        &self,
        peer: &PeerIdentifier,
        matches: impl FnOnce(&PeerListener) -> bool,
    ) -> Option<PeerListener> {
        let mut state = self.state.lock();
        if !state.peers.get(peer).is_some_and(matches) {
            return None;
        }
        let removed = state.peers.remove(peer);
        self.metrics.set_peer_listeners(state.peers.len());
        removed
    }

    fn shutdown(&self) -> bool {
        let (native, incoming, peers) = {
            let mut state = self.state.lock();
            if state.lifecycle == MuxLifecycle::Stopped {
                return false;
            }
            state.lifecycle = MuxLifecycle::Stopped;
            (
                state.native_listener.take(),
                std::mem::take(&mut state.incoming),
                std::mem::take(&mut state.peers),
            )
        };
        self.metrics.set_peer_listeners(0);

        if let Some(listener) = native {
            listener.task.abort();
        }
        for (_, relay) in incoming {
            relay.abort();
        }
        for (_, listener) in peers {
            listener.close();
        }
        true
    }
}

/// Turns native sessions into local TCP sockets and back.
///
/// Inbound: one loopback listener receives the sessions the native stack pushes, and
/// each is paired with a fresh connection to the application router.
///
/// Outbound: each peer gets its own loopback listener. A local connection to it is
/// paired with a connection to the peer's native session, opening that session first
/// when needed.
///
/// All tasks are aborted on [`stop`](Self::stop) or drop; each socket has exactly one
/// owning task, which closes it.
pub struct ConnectionMultiplexer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("router_port", &self.shared.router_port)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl ConnectionMultiplexer {
    /// Creates a multiplexer that hands inbound sessions to `router_port`.
    pub fn new(
        bridge: Arc<dyn NativeBridge>,
        router_port: u16,
        config: MuxConfig,
        events: MuxEventSender,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                router_port,
                bridge,
                events,
                state: Mutex::new(MuxState {
                    lifecycle: MuxLifecycle::Initialized,
                    native_listener: None,
                    incoming: HashMap::new(),
                    peers: HashMap::new(),
                    next_epoch: 0,
                }),
                next_incoming_id: AtomicU64::new(0),
                metrics: MuxMetrics::new(),
            }),
        }
    }

    pub fn router_port(&self) -> u16 {
        self.shared.router_port
    }

    pub fn lifecycle(&self) -> MuxLifecycle {
        self.shared.state.lock().lifecycle
    }

    /// Port the native stack should push inbound sessions to, while started.
    pub fn native_listener_port(&self) -> Option<u16> {
        self.shared
            .state
            .lock()
            .native_listener
            .as_ref()
            .map(|listener| listener.port)
    }

    /// Binds the inbound listener and returns its port. Calling it again while started
    /// returns the same port; a stopped multiplexer cannot be restarted.
    pub async fn start(&self) -> Result<u16, MuxError> {
        match self.lifecycle() {
            MuxLifecycle::Stopped => return Err(MuxError::Stopped),
            MuxLifecycle::Started => return self.native_listener_port().ok_or(MuxError::Stopped),
            MuxLifecycle::Initialized => {}
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let mut state = self.shared.state.lock();
        match state.lifecycle {
            MuxLifecycle::Stopped => return Err(MuxError::Stopped),
            MuxLifecycle::Started => {
                return state
                    .native_listener
                    .as_ref()
                    .map(|listener| listener.port)
                    .ok_or(MuxError::Stopped);
            }
            MuxLifecycle::Initialized => {}
        }
        let task = tokio::spawn(inbound::run_native_listener(
            Arc::clone(&self.shared),
            listener,
        ));
        state.native_listener = Some(NativeListener { port, task });
        state.lifecycle = MuxLifecycle::Started;
        info!(port, router_port = self.shared.router_port, "multiplexer started");
        Ok(port)
    }

    /// Closes every listener and session. Idempotent.
    pub fn stop(&self) {
        if self.shared.shutdown() {
            info!(router_port = self.shared.router_port, "multiplexer stopped");
        }
    }

    /// Returns the local port that reaches `peer`, creating the listener on first use.
    ///
    /// With `please_connect` the native session is opened right away instead of on the
    /// first local connection.
    pub async fn create_peer_listener(
        &self,
        peer: &PeerIdentifier,
        please_connect: bool,
    ) -> Result<u16, MuxError> {
        self.shared.ensure_started()?;
        let (port, native) = match self.shared.existing_listener(peer) {
            Some(existing) => existing,
            None => {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                self.shared.install_peer_listener(peer, listener)?
            }
        };
        if please_connect {
            self.shared.spawn_native_connect(peer.clone(), native);
        }
        Ok(port)
    }

    /// Makes sure `peer` has a listener and an open native session, and returns the
    /// listener port.
    pub async fn connect_on_demand(&self, peer: &PeerIdentifier) -> Result<u16, MuxError> {
        let port = self.create_peer_listener(peer, false).await?;
        let (_, native) = self
            .shared
            .existing_listener(peer)
            .ok_or(MuxError::Stopped)?;
        if let Err(error) = outbound::ensure_native(&self.shared, peer, &native).await {
            self.shared.emit(MuxEvent::FailedConnection {
                peer_identifier: peer.clone(),
                error: error.to_string(),
            });
            return Err(error);
        }
        Ok(port)
    }

    pub fn peer_listener_port(&self, peer: &PeerIdentifier) -> Option<u16> {
        self.shared.existing_listener(peer).map(|(port, _)| port)
    }

    pub fn incoming_connections(&self) -> Vec<IncomingConnectionId> {
        let mut ids: Vec<_> = self.shared.state.lock().incoming.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Closes one inbound session. Unknown or already closed sessions are fine.
    pub fn terminate_incoming_connection(&self, id: IncomingConnectionId) {
        let Some(relay) = self.shared.state.lock().incoming.remove(&id) else {
            trace!(%id, "incoming connection already gone");
            return;
        };
        relay.abort();
        debug!(%id, "incoming connection terminated");
        self.shared.emit(MuxEvent::IncomingConnectionState {
            incoming_connection_id: id,
            state: IncomingConnectionState::Disconnected,
        });
    }

    /// Closes the listener serving `peer` on `port` with all its sessions and drops the
    /// native session. Succeeds if there is nothing to close.
    pub async fn terminate_outgoing_connection(&self, peer: &PeerIdentifier, port: u16) {
        let Some(listener) = self
            .shared
            .remove_peer_listener(peer, |listener| listener.port == port)
        else {
            trace!(%peer, port, "outgoing connection already gone");
            return;
        };
        debug!(%peer, port, "outgoing connection terminated");
        if listener.close() {
            if let Err(error) = self.shared.bridge.disconnect(peer).await {
                debug!(%peer, %error, "native disconnect failed");
            }
        }
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
