use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::ProtocolEnvelope;

/// Default cap on a single frame body (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds cap of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame body is not valid UTF-8 JSON: {0}")]
    Invalid(String),
    #[error("frame JSON has no recognized `type` field")]
    InvalidEnvelope,
    #[error("peer closed the stream")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Wire error code for this failure, per the protocol taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::TooLarge { .. } => "frame_too_large",
            FrameError::Invalid(_) => "invalid_frame",
            FrameError::InvalidEnvelope => "invalid_envelope",
            FrameError::Closed | FrameError::Io(_) => "connection_closed",
        }
    }
}

/// Read one length-prefixed frame: 4-byte big-endian length, then that many
/// bytes of UTF-8 JSON. Returns `Closed` on clean EOF at a frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<ProtocolEnvelope<Value>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(error) => return Err(error.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_bytes {
        // Drain the oversized body so the stream stays at a frame boundary
        // and the connection can report the error and keep going.
        let mut remaining = len as u64;
        let mut sink = [0u8; 4096];
        while remaining > 0 {
            let take = remaining.min(sink.len() as u64) as usize;
            match reader.read_exact(&mut sink[..take]).await {
                Ok(_) => remaining -= take as u64,
                Err(_) => break,
            }
        }
        return Err(FrameError::TooLarge {
            len,
            max: max_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|error| match error.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(error),
        })?;

    let text = std::str::from_utf8(&body).map_err(|error| FrameError::Invalid(error.to_string()))?;
    let json: Value =
        serde_json::from_str(text).map_err(|error| FrameError::Invalid(error.to_string()))?;
    if json.get("type").and_then(Value::as_str).is_none() {
        return Err(FrameError::InvalidEnvelope);
    }

    serde_json::from_value(json).map_err(|error| FrameError::Invalid(error.to_string()))
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &ProtocolEnvelope<Value>,
    max_bytes: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame).map_err(|error| FrameError::Invalid(error.to_string()))?;
    if body.len() > max_bytes {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max: max_bytes,
        });
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
