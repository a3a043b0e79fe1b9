//! Length-prefixed framing shared by the signalling transport and the media
//! channel: `[u32 big-endian length][length bytes of JSON-serialized
//! Envelope]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;
use crate::protocol::types::Envelope;

/// No single frame may exceed this. A 256 KiB chunk base64-inflates to
/// roughly 342 KiB before JSON overhead; 4 MiB leaves ample headroom while
/// still bounding a misbehaving peer's memory impact on us.
pub const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Writes one framed envelope to `writer`.
pub async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    env: &Envelope,
) -> Result<(), CodecError> {
    let body = serde_json::to_vec(env)?;
    let len = u32::try_from(body.len())
        .map_err(|_| CodecError::FrameTooLarge(u32::MAX, MAX_FRAME_BYTES))?;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed envelope from `reader`, or `Ok(None)` on clean EOF
/// (no bytes read for the length header).
pub async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Envelope>, CodecError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len, MAX_FRAME_BYTES));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let env: Envelope = serde_json::from_slice(&body)?;
    Ok(Some(env))
}
