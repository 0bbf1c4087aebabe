//! The application-facing listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{trace, warn};
use vicinity_net_bridge::ConnectionRouter;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Hands every accepted connection to `router` until aborted.
pub(crate) async fn run_app_listener(listener: TcpListener, router: Arc<dyn ConnectionRouter>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                trace!(%remote, "routing connection");
                router.route(stream, remote);
            }
            Err(error) => {
                warn!(%error, "application listener accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
