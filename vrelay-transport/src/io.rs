//! Chunked message reads and writes.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vrelay_protocol::{Completion, MessageBuffer, ProtocolError};

/// When [`read_message`] stops reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadUntil {
    /// As soon as the buffer's framing judges the message complete, or on
    /// end of stream.
    Complete,
    /// Only at end of stream; completion reported by the framing is ignored.
    Close,
}

/// Reads one message from `reader` in `chunk_size` reads.
///
/// Returns the message payload as produced by [`MessageBuffer::finish`].
/// The caller bounds the whole read with a timeout.
pub async fn read_message<R>(
    reader: &mut R,
    mut buffer: MessageBuffer,
    chunk_size: usize,
    until: ReadUntil,
) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; chunk_size.max(1)];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            tracing::debug!("Peer closed stream ({} bytes buffered)", buffer.buffered());
            break;
        }

        let completion = buffer.extend(&chunk[..n])?;
        tracing::debug!("Read {} bytes ({} buffered)", n, buffer.buffered());

        if completion == Completion::Complete && until == ReadUntil::Complete {
            tracing::debug!("Message complete ({} framing)", buffer.framing());
            break;
        }
    }

    buffer.finish()
}

/// Writes a whole message and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message).await?;
    writer.flush().await
}
