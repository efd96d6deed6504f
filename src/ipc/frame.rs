//! Frame codec: a big-endian `u32` body length followed by a JSON body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Transport failure, including EOF in the middle of a frame.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Body is not valid JSON for the expected message.
    #[error("frame JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Declared or encoded length exceeds the limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Frame length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Serialize `message` and write it as one frame.
///
/// # Errors
///
/// Returns [`FrameError`] if encoding fails, the body is too large, or the
/// write fails.
pub async fn write_frame<W, T>(writer: &mut W, message: &T, max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > max {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
///
/// # Errors
///
/// Returns [`FrameError`] on truncated frames, oversize lengths, or bodies
/// that do not decode as `T`.
pub async fn read_frame<R, T>(reader: &mut R, max: usize) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled = filled.saturating_add(n);
    }

    let len = usize::try_from(u32::from_be_bytes(header)).unwrap_or(usize::MAX);
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
