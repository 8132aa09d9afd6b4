//! Transport façade: connect/listen/accept and framed send/recv over a
//! channel, independent of the concrete backend.
//!
//! `spec.md` keeps the native transport library itself out of scope; this
//! module is the contract every concrete backend (socket, and eventually a
//! reliable-datagram fabric) satisfies, plus the one concrete backend this
//! crate ships: TCP sockets via `tokio::net`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{XpnError, XpnResult};

/// A connected, full-duplex byte channel between a client and a server.
/// The transport guarantees in-order, exactly-once, reliable delivery for
/// the channel's lifetime; on failure the caller sees [`XpnError::Transport`]
/// and must reconnect.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&mut self, buf: &[u8]) -> XpnResult<()>;
    async fn recv(&mut self, len: usize) -> XpnResult<Vec<u8>>;
    async fn close(&mut self) -> XpnResult<()>;
}

/// Accepts inbound channels on a listening endpoint.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&mut self) -> XpnResult<Box<dyn Channel>>;
}

/// Connects to `endpoint` (`host:port`), failing after `timeout`.
pub async fn connect(endpoint: &str, timeout: Duration) -> XpnResult<Box<dyn Channel>> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| XpnError::TimedOut)?
        .map_err(|e| XpnError::Transport(e.to_string()))?;
    stream.set_nodelay(true).map_err(|e| XpnError::Transport(e.to_string()))?;
    Ok(Box::new(SocketChannel { stream }))
}

/// Starts listening on `endpoint` (`host:port`).
pub async fn listen(endpoint: &str) -> XpnResult<Box<dyn Acceptor>> {
    let listener = TcpListener::bind(endpoint).await.map_err(|e| XpnError::Transport(e.to_string()))?;
    Ok(Box::new(SocketAcceptor { listener }))
}

struct SocketChannel {
    stream: TcpStream,
}

#[async_trait]
impl Channel for SocketChannel {
    async fn send(&mut self, buf: &[u8]) -> XpnResult<()> {
        self.stream.write_all(buf).await.map_err(|e| XpnError::Transport(e.to_string()))
    }

    async fn recv(&mut self, len: usize) -> XpnResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await.map_err(|e| XpnError::Transport(e.to_string()))?;
        Ok(buf)
    }

    async fn close(&mut self) -> XpnResult<()> {
        self.stream.shutdown().await.map_err(|e| XpnError::Transport(e.to_string()))
    }
}

struct SocketAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for SocketAcceptor {
    async fn accept(&mut self) -> XpnResult<Box<dyn Channel>> {
        let (stream, _) = self.listener.accept().await.map_err(|e| XpnError::Transport(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| XpnError::Transport(e.to_string()))?;
        Ok(Box::new(SocketChannel { stream }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_frame_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = SocketChannel { stream };
            let received = channel.recv(5).await.unwrap();
            channel.send(&received).await.unwrap();
        });

        let mut client = connect(&addr.to_string(), Duration::from_secs(1)).await.unwrap();
        client.send(b"hello").await.unwrap();
        let echoed = client.recv(5).await.unwrap();
        assert_eq!(echoed, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_nothing_times_out_or_errors() {
        let result = connect("127.0.0.1:1", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
