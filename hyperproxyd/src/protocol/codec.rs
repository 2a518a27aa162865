//! Frame reads/writes over an async byte stream.
//!
//! Reads are serialized per socket by construction (each client socket has
//! exactly one reader task). Writes are serialized by [`SharedWriter`]'s
//! lock, since both the per-client dispatcher (responses) and the I/O
//! multiplexer (stream/notification pushes) write to the same shim
//! socket (§4.1, §5).

use std::sync::Arc;

use hyperproxy_protocol::frame::{FrameHeader, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{DaemonError, DaemonResult};

/// Read exactly one frame, failing on truncation or an oversized payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_len: u32,
) -> DaemonResult<(FrameHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DaemonError::Protocol("truncated frame header".into())
        } else {
            DaemonError::Io(e)
        }
    })?;

    let header = FrameHeader::decode(&header_buf).map_err(DaemonError::Protocol)?;

    if header.payload_len > max_payload_len {
        return Err(DaemonError::Protocol(format!(
            "payload length {} exceeds ceiling {}",
            header.payload_len, max_payload_len
        )));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DaemonError::Protocol("truncated frame payload".into())
        } else {
            DaemonError::Io(e)
        }
    })?;

    Ok((header, payload))
}

/// Write exactly one frame in a single buffered write.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &FrameHeader,
    payload: &[u8],
) -> DaemonResult<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// A socket's write half, shared between the client dispatcher (replies)
/// and the I/O multiplexer (async stream/notification pushes), guarded so
/// writes from either side never interleave mid-frame.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
}

impl SharedWriter {
    pub fn new(half: tokio::net::unix::OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(half)),
        }
    }

    pub async fn write(&self, header: &FrameHeader, payload: &[u8]) -> DaemonResult<()> {
        let mut guard = self.inner.lock().await;
        write_frame(&mut *guard, header, payload).await
    }
}
