//! Local listeners standing in for remote peers.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use vicinity_net_primitives::PeerIdentifier;

use crate::error::MuxError;
use crate::event::MuxEvent;
use crate::inbound::ACCEPT_BACKOFF;
use crate::mux::{NativeSlot, Shared};
use crate::relay::{RelayEnd, relay};

pub(crate) async fn run_peer_listener(
    shared: Arc<Shared>,
    peer: PeerIdentifier,
    epoch: u64,
    native: NativeSlot,
    listener: TcpListener,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((local, addr)) => {
                    trace!(%peer, %addr, "local connection for peer");
                    sessions.spawn(serve_outbound(
                        Arc::clone(&shared),
                        peer.clone(),
                        epoch,
                        Arc::clone(&native),
                        local,
                    ));
                }
                Err(error) => {
                    warn!(%peer, %error, "peer listener accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn serve_outbound(
    shared: Arc<Shared>,
    peer: PeerIdentifier,
    epoch: u64,
    native: NativeSlot,
    local: TcpStream,
) {
    let remote = match open_native_stream(&shared, &peer, &native).await {
        Ok(remote) => remote,
        Err(error) => {
            warn!(%peer, %error, "native connect failed");
            shared.emit(MuxEvent::FailedConnection {
                peer_identifier: peer,
                error: error.to_string(),
            });
            return;
        }
    };

    session_opened(&shared, &peer, epoch);
    let end = relay(
        local,
        remote,
        shared.config.session_idle_timeout,
        shared.config.relay_buffer_size,
    )
    .await;
    let idle = matches!(end, RelayEnd::Idle);
    match end {
        RelayEnd::Closed => trace!(%peer, "outgoing session closed"),
        RelayEnd::Idle => {
            shared.metrics.idle_closed();
            debug!(%peer, "outgoing session idle, closed");
        }
        RelayEnd::Failed(error) => debug!(%peer, %error, "outgoing session failed"),
    }

    if session_closed(&shared, &peer, epoch) && idle {
        // Runs outside this listener's task set, which it is about to abort.
        tokio::spawn(recreate_listener(shared, peer, epoch));
    }
}

fn session_opened(shared: &Shared, peer: &PeerIdentifier, epoch: u64) {
    shared.metrics.outbound_opened();
    let mut state = shared.state.lock();
    if let Some(listener) = state.peers.get_mut(peer).filter(|l| l.epoch == epoch) {
        listener.active_sessions += 1;
    }
}

/// Returns true if this was the last session on the listener.
fn session_closed(shared: &Shared, peer: &PeerIdentifier, epoch: u64) -> bool {
    let mut state = shared.state.lock();
    match state.peers.get_mut(peer).filter(|l| l.epoch == epoch) {
        Some(listener) => {
            listener.active_sessions = listener.active_sessions.saturating_sub(1);
            listener.active_sessions == 0
        }
        None => false,
    }
}

/// Replaces the listener of a peer whose sessions all idled out, dropping the native
/// session with it, and reports the new port after a fresh native connect.
async fn recreate_listener(shared: Arc<Shared>, peer: PeerIdentifier, epoch: u64) {
    let Some(old) = shared.remove_peer_listener(&peer, |listener| {
        listener.epoch == epoch && listener.active_sessions == 0
    }) else {
        return;
    };
    let old_port = old.port;
    if old.close() {
        if let Err(error) = shared.bridge.disconnect(&peer).await {
            debug!(%peer, %error, "native disconnect failed");
        }
    }

    if !shared.is_started() {
        return;
    }
    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%peer, %error, "could not recreate peer listener");
            shared.emit(MuxEvent::FailedConnection {
                peer_identifier: peer,
                error: error.to_string(),
            });
            return;
        }
    };
    let (port, native) = match shared.install_peer_listener(&peer, listener) {
        Ok(installed) => installed,
        Err(error) => {
            trace!(%peer, %error, "multiplexer stopped while recreating listener");
            return;
        }
    };
    debug!(%peer, old_port, port, "peer listener recreated, reconnecting");

    // Announced only once the peer answers again.
    match ensure_native(&shared, &peer, &native).await {
        Ok(_) if shared.peer_listener_is(&peer, port) => {
            shared.emit(MuxEvent::ListenerRecreatedAfterFailure {
                peer_identifier: peer,
                port_number: port,
            });
        }
        Ok(_) => trace!(%peer, port, "recreated listener closed before reconnecting"),
        Err(error) => {
            warn!(%peer, %error, "native reconnect after idle failed");
            shared.emit(MuxEvent::FailedConnection {
                peer_identifier: peer,
                error: error.to_string(),
            });
        }
    }
}

/// Opens the native session to `peer` unless one is already open, and returns its
/// loopback port.
pub(crate) async fn ensure_native(
    shared: &Shared,
    peer: &PeerIdentifier,
    native: &NativeSlot,
) -> Result<u16, MuxError> {
    let mut slot = native.lock().await;
    if let Some(port) = *slot {
        return Ok(port);
    }
    let port = shared.bridge.connect(peer).await?;
    debug!(%peer, port, "native session opened");
    *slot = Some(port);
    Ok(port)
}

/// Connects to the peer's native session, reusing the open one when it still answers
/// and opening a new one otherwise.
async fn open_native_stream(
    shared: &Shared,
    peer: &PeerIdentifier,
    native: &NativeSlot,
) -> Result<TcpStream, MuxError> {
    let mut slot = native.lock().await;
    if let Some(port) = *slot {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(%peer, port, %error, "native session gone, reconnecting");
                *slot = None;
            }
        }
    }

    let port = shared.bridge.connect(peer).await?;
    debug!(%peer, port, "native session opened");
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    *slot = Some(port);
    Ok(stream)
}
