//! AF_VSOCK support. Only Linux hosts provide virtual sockets; elsewhere the
//! types are uninhabited and every operation fails with `Unsupported`.

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    pub use tokio_vsock::{VsockListener, VsockStream};
    use tokio_vsock::VsockAddr;

    pub const SUPPORTED: bool = true;

    pub fn bind(cid: u32, port: u32) -> io::Result<VsockListener> {
        VsockListener::bind(VsockAddr::new(cid, port))
    }

    pub async fn connect(cid: u32, port: u32) -> io::Result<VsockStream> {
        VsockStream::connect(VsockAddr::new(cid, port)).await
    }

    pub async fn accept(listener: &mut VsockListener) -> io::Result<(VsockStream, u32, u32)> {
        let (stream, addr) = listener.accept().await?;
        Ok((stream, addr.cid(), addr.port()))
    }

    pub fn local_addr(listener: &VsockListener) -> io::Result<(u32, u32)> {
        let addr = listener.local_addr()?;
        Ok((addr.cid(), addr.port()))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    pub const SUPPORTED: bool = false;

    pub enum VsockListener {}

    pub enum VsockStream {}

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock transport is not supported on this host",
        )
    }

    pub fn bind(_cid: u32, _port: u32) -> io::Result<VsockListener> {
        Err(unsupported())
    }

    pub async fn connect(_cid: u32, _port: u32) -> io::Result<VsockStream> {
        Err(unsupported())
    }

    pub async fn accept(listener: &mut VsockListener) -> io::Result<(VsockStream, u32, u32)> {
        match *listener {}
    }

    pub fn local_addr(listener: &VsockListener) -> io::Result<(u32, u32)> {
        match *listener {}
    }

    impl AsyncRead for VsockStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match *self.get_mut() {}
        }
    }

    impl AsyncWrite for VsockStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match *self.get_mut() {}
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match *self.get_mut() {}
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match *self.get_mut() {}
        }
    }
}

pub use imp::*;
