//! Bidirectional byte relay between two sockets.

use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep};

/// How a relay finished.
#[derive(Debug)]
pub(crate) enum RelayEnd {
    /// Both sides finished writing.
    Closed,
    /// No bytes moved for the idle timeout.
    Idle,
    Failed(io::Error),
}

/// Copies bytes both ways until both directions are closed, one side errors, or the
/// session goes idle.
///
/// Owns both sockets, so they are closed exactly once, when this returns. EOF on one
/// side is propagated as a write shutdown on the other. The directions run
/// concurrently with the idle deadline, so a write blocked on a peer that stopped
/// reading still times out.
pub(crate) async fn relay(
    mut a: TcpStream,
    mut b: TcpStream,
    idle_timeout: Duration,
    buffer_size: usize,
) -> RelayEnd {
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();
    let last_activity = Mutex::new(Instant::now());

    let copy = async {
        tokio::try_join!(
            pipe(a_read, b_write, &last_activity, buffer_size),
            pipe(b_read, a_write, &last_activity, buffer_size),
        )
    };
    tokio::pin!(copy);
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            copied = &mut copy => {
                return match copied {
                    Ok(_) => RelayEnd::Closed,
                    Err(error) => RelayEnd::Failed(error),
                };
            }
            () = &mut idle => {
                let deadline = *last_activity.lock() + idle_timeout;
                if deadline <= Instant::now() {
                    return RelayEnd::Idle;
                }
                idle.as_mut().reset(deadline);
            }
        }
    }
}

/// One direction of [`relay`]. Stamps `last_activity` whenever bytes move.
async fn pipe<R, W>(
    mut from: R,
    mut to: W,
    last_activity: &Mutex<Instant>,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            let _ = to.shutdown().await;
            return Ok(());
        }
        *last_activity.lock() = Instant::now();
        to.write_all(buf.get(..n).unwrap_or_default()).await?;
        *last_activity.lock() = Instant::now();
    }
}
