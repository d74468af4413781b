//! Raw TCP relay.

use super::binding::connect_backend;
use super::error::ProxyResult;
use std::net::SocketAddr;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::debug;

/// Byte-for-byte relay between client and remote.
pub struct TcpPipeline {
    remote_addr: SocketAddr,
    via_addr: SocketAddr,
}

impl TcpPipeline {
    pub(crate) fn new(remote_addr: SocketAddr, via_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            via_addr,
        }
    }

    /// Relay one client connection.
    ///
    /// The client is not read until the backend connection exists.
    pub async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let mut backend = connect_backend(self.via_addr, self.remote_addr).await?;
        debug!("{} -> backend {} connected", peer, self.remote_addr);

        let (to_remote, to_client) = copy_bidirectional(&mut stream, &mut backend).await?;
        debug!(
            "{} closed: {} bytes to remote, {} bytes to client",
            peer, to_remote, to_client
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_relay_echo() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let pipeline = TcpPipeline::new(echo_addr, "0.0.0.0:0".parse().unwrap());
        tokio::spawn(async move {
            let (stream, peer) = front.accept().await.unwrap();
            let _ = pipeline.serve(stream, peer).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
