//! TCP socket transport.
//!
//! A thin reliable-byte-stream abstraction over `tokio::net::TcpStream`.
//! No framing: the channel layer owns frame boundaries and sequencing.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use evt_core::error::{Error, Result};
use evt_core::SocketEndpoint;

/// One live TCP connection to the server.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to the endpoint, bounded by `timeout`.
    ///
    /// An elapsed timeout maps to `Error::Timeout` (retryable); any other
    /// failure maps to `Error::Transport`.
    pub async fn connect(endpoint: &SocketEndpoint, timeout: Duration) -> Result<Self> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport {
                message: format!("connect to {endpoint} failed: {e}"),
            })?;

        // Terminal traffic is latency sensitive
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        debug!(endpoint = %endpoint, "transport connected");
        Ok(Self { stream })
    }

    /// Wait until the socket is readable.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Non-blocking read of whatever is currently available.
    ///
    /// Returns the number of bytes appended to `buf`; `Ok(0)` means nothing
    /// was available. A peer close surfaces as `Error::ConnectionClosed`.
    pub fn try_read(&self, buf: &mut BytesMut) -> Result<usize> {
        match self.stream.try_read_buf(buf) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Transport {
                message: format!("read failed: {e}"),
            }),
        }
    }

    /// Write the full buffer to the socket.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(|e| Error::Transport {
            message: format!("write failed: {e}"),
        })
    }

    /// Read exactly `buf.len()` bytes (resume handshake only).
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        use tokio::io::AsyncReadExt;
        self.stream.read_exact(buf).await.map_err(|e| Error::Transport {
            message: format!("read failed: {e}"),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        // Port 1 on localhost is almost certainly closed
        let endpoint = SocketEndpoint::new("127.0.0.1", 1, false);
        let err = TcpTransport::connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. } | Error::Timeout));
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = SocketEndpoint::new("127.0.0.1", addr.port(), false);

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut peer, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut peer, &buf).await.unwrap();
        });

        let mut transport = TcpTransport::connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        transport.write_all(b"hello").await.unwrap();

        let mut echo = [0u8; 5];
        transport.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn try_read_reports_peer_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = SocketEndpoint::new("127.0.0.1", addr.port(), false);

        let transport = TcpTransport::connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        transport.readable().await.unwrap();
        let mut buf = BytesMut::new();
        let err = transport.try_read(&mut buf).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
