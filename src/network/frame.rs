//! Length-prefixed framing: `len: u32 (little-endian) | body`.

use crate::error::{PqnError, PqnResult};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame body. `Ok(None)` means the peer closed between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> PqnResult<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(PqnError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> PqnResult<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(PqnError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
