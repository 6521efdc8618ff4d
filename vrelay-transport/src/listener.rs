//! Listening sockets for the backend.

use crate::endpoint::{Endpoint, PeerAddr};
use crate::stream::RelayStream;
use crate::vsock::{self, VsockListener};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};

/// Accept backlog for listening sockets.
pub const ACCEPT_BACKLOG: u32 = 128;

/// A bound, listening socket on either transport.
pub enum RelayListener {
    Tcp(TcpListener),
    Vsock(VsockListener),
}

impl RelayListener {
    /// Binds a listening socket to `endpoint`.
    ///
    /// Fails if the host cannot be resolved, the address is unavailable, or
    /// the transport is not supported on this host.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = resolve(host, *port).await?;
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                Ok(RelayListener::Tcp(socket.listen(ACCEPT_BACKLOG)?))
            }
            Endpoint::Vsock { cid, port } => Ok(RelayListener::Vsock(vsock::bind(*cid, *port)?)),
        }
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&mut self) -> io::Result<(RelayStream, PeerAddr)> {
        match self {
            RelayListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((RelayStream::Tcp { stream }, PeerAddr::Tcp(addr)))
            }
            RelayListener::Vsock(listener) => {
                let (stream, cid, port) = vsock::accept(listener).await?;
                Ok((RelayStream::Vsock { stream }, PeerAddr::Vsock { cid, port }))
            }
        }
    }

    /// Returns the endpoint actually bound (resolves port 0 for TCP).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            RelayListener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::tcp(addr.ip().to_string(), addr.port()))
            }
            RelayListener::Vsock(listener) => {
                let (cid, port) = vsock::local_addr(listener)?;
                Ok(Endpoint::vsock(cid, port))
            }
        }
    }
}

/// Source of inbound connections for an accept loop.
pub trait Accept: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, PeerAddr)>> + Send;

    /// Endpoint connections arrive on.
    fn local_endpoint(&self) -> io::Result<Endpoint>;
}

impl Accept for RelayListener {
    type Stream = RelayStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(RelayStream, PeerAddr)>> + Send {
        RelayListener::accept(self)
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        RelayListener::local_endpoint(self)
    }
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("could not resolve host '{}'", host),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_tcp() {
        let mut listener = RelayListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let port = match endpoint {
            Endpoint::Tcp { port, .. } => port,
            other => panic!("unexpected endpoint {other}"),
        };
        assert_ne!(port, 0);

        let client = tokio::spawn(async move {
            let mut stream = RelayStream::connect(&endpoint).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            stream.close().await;
        });

        let (mut stream, peer) = listener.accept().await.unwrap();
        assert!(matches!(peer, PeerAddr::Tcp(addr) if addr.ip().is_loopback()));

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = RelayListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let endpoint = first.local_endpoint().unwrap();

        // SO_REUSEADDR does not allow two live listeners on one port
        let second = RelayListener::bind(&endpoint).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_bind_unresolvable_host() {
        let result = RelayListener::bind(&Endpoint::tcp("host.invalid", 9001)).await;
        assert!(result.is_err());
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn test_vsock_unsupported() {
        let result = RelayListener::bind(&Endpoint::vsock(crate::VMADDR_CID_ANY, 9001)).await;
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::Unsupported);
    }
}
