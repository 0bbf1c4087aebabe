use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpStream;
use vicinity_net_bridge::ConnectionRouter;

use crate::net::echo;

/// Router that echoes every connection back and counts them.
#[derive(Debug, Default)]
pub struct EchoRouter {
    routed: AtomicUsize,
}

impl EchoRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routed(&self) -> usize {
        self.routed.load(Ordering::SeqCst)
    }
}

impl ConnectionRouter for EchoRouter {
    fn route(&self, stream: TcpStream, _remote: SocketAddr) {
        self.routed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(echo(stream));
    }
}

/// Router that fails its start check.
#[derive(Debug, Default)]
pub struct RejectingRouter;

impl ConnectionRouter for RejectingRouter {
    fn check(&self) -> Result<(), String> {
        Err("router cannot be mounted".to_owned())
    }

    fn route(&self, stream: TcpStream, _remote: SocketAddr) {
        drop(stream);
    }
}
