//! Sessions pushed to us by the native stack.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::event::{IncomingConnectionId, IncomingConnectionState, MuxEvent};
use crate::mux::Shared;
use crate::relay::{RelayEnd, relay};

pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) async fn run_native_listener(shared: Arc<Shared>, listener: TcpListener) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((native, addr)) => {
                    trace!(%addr, "native session accepted");
                    spawn_incoming(&shared, &mut relays, native);
                }
                Err(error) => {
                    warn!(%error, "native listener accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }
}

fn spawn_incoming(shared: &Arc<Shared>, relays: &mut JoinSet<()>, native: TcpStream) {
    let id = shared.next_incoming_id();
    let mut state = shared.state.lock();
    let handle = relays.spawn(serve_incoming(Arc::clone(shared), id, native));
    state.incoming.insert(id, handle);
}

async fn serve_incoming(shared: Arc<Shared>, id: IncomingConnectionId, native: TcpStream) {
    let router_port = shared.router_port;
    let router = match TcpStream::connect((Ipv4Addr::LOCALHOST, router_port)).await {
        Ok(router) => router,
        Err(error) => {
            warn!(%id, router_port, %error, "router port unreachable");
            shared.forget_incoming(id);
            shared.emit(MuxEvent::RouterPortConnectionFailed {
                router_port,
                error: error.to_string(),
            });
            return;
        }
    };

    shared.metrics.inbound_opened();
    shared.emit(MuxEvent::IncomingConnectionState {
        incoming_connection_id: id,
        state: IncomingConnectionState::Connected,
    });

    match relay(
        native,
        router,
        shared.config.session_idle_timeout,
        shared.config.relay_buffer_size,
    )
    .await
    {
        RelayEnd::Closed => trace!(%id, "incoming session closed"),
        RelayEnd::Idle => {
            shared.metrics.idle_closed();
            debug!(%id, "incoming session idle, closed");
        }
        RelayEnd::Failed(error) => debug!(%id, %error, "incoming session failed"),
    }

    if shared.forget_incoming(id) {
        shared.emit(MuxEvent::IncomingConnectionState {
            incoming_connection_id: id,
            state: IncomingConnectionState::Disconnected,
        });
    }
}
