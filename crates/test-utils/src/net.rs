use std::net::Ipv4Addr;

use tokio::io::{self, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// Writes back everything it reads until the peer closes.
pub async fn echo(mut stream: TcpStream) {
    let (mut reader, mut writer) = stream.split();
    let _ = io::copy(&mut reader, &mut writer).await;
}

/// Reads exactly `len` bytes.
pub async fn read_exactly(stream: &mut TcpStream, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Loopback echo server. Stops accepting and drops every connection when dropped.
#[derive(Debug)]
pub struct EchoServer {
    port: u16,
    task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                connections.spawn(echo(stream));
            }
        });
        Ok(Self { port, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
