//! Stream abstraction over vsock and plain TCP.

use crate::endpoint::Endpoint;
use crate::vsock::{self, VsockStream};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

pin_project! {
    /// One connection between gateway and backend, over either transport.
    #[project = RelayStreamProj]
    pub enum RelayStream {
        Tcp { #[pin] stream: TcpStream },
        Vsock { #[pin] stream: VsockStream },
    }
}

impl RelayStream {
    /// Opens a new connection to `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true).ok();
                Ok(RelayStream::Tcp { stream })
            }
            Endpoint::Vsock { cid, port } => {
                let stream = vsock::connect(*cid, *port).await?;
                Ok(RelayStream::Vsock { stream })
            }
        }
    }

    /// Returns whether this stream runs over a virtual socket.
    pub fn is_vsock(&self) -> bool {
        matches!(self, RelayStream::Vsock { .. })
    }

    /// Shuts down the write side and drops the stream. Errors are ignored:
    /// the connection is gone either way.
    pub async fn close(mut self) {
        if let Err(e) = self.shutdown().await {
            tracing::debug!("Shutdown error while closing stream: {}", e);
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            RelayStreamProj::Vsock { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            RelayStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            RelayStreamProj::Vsock { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Tcp { stream } => stream.poll_flush(cx),
            RelayStreamProj::Vsock { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            RelayStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            RelayStreamProj::Vsock { stream } => stream.poll_shutdown(cx),
        }
    }
}
