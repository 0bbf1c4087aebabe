use std::net::SocketAddr;

use auto_impl::auto_impl;
use tokio::net::TcpStream;

/// The application server that virtual connections terminate at.
///
/// The coordinator owns the listening socket and hands every accepted connection to
/// [`route`](Self::route), from inside the accept loop. Implementations must not block;
/// spawn the work instead.
#[auto_impl(&, Box, Arc)]
pub trait ConnectionRouter: Send + Sync {
    /// Checked once on start. An error rejects the router.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }

    fn route(&self, stream: TcpStream, remote: SocketAddr);
}
