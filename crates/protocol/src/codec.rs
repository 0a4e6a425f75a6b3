//! Message serialization and deserialization using postcard
//!
//! Messages are serialized with postcard and framed with a length prefix when
//! the bridge is driven over a byte stream (stdin/stdout in `serve` mode).
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```

use crate::{CURRENT_VERSION, Message, ProtocolVersion, error::ProtocolError, error::Result};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message to bytes using postcard
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Major versions must match; minor differences are accepted both ways.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

fn check_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{CallId, Message, MessagePayload, MethodResponse, CURRENT_VERSION, encode_framed};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: MessagePayload::Reply {
///         id: CallId(1),
///         response: MethodResponse::NotImplemented,
///     },
/// };
/// let framed = encode_framed(&msg).unwrap();
/// assert!(framed.len() >= 4);
/// ```
pub fn encode_framed(message: &Message) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();
    check_frame_size(message_len)?;

    let mut frame = Vec::with_capacity(4 + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a framed message
///
/// Trailing bytes after the announced length are ignored.
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    if frame.len() < 4 {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            actual: frame.len(),
        });
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    check_frame_size(length)?;

    if frame.len() < 4 + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + length,
            actual: frame.len(),
        });
    }

    decode_message(&frame[4..4 + length])
}

/// Write a framed message to a blocking writer
pub fn write_framed<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let framed = encode_framed(message)?;
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read a framed message from a blocking reader
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    check_frame_size(length)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes)?;

    decode_message(&message_bytes)
}

/// Async: write already framed bytes to an async writer
#[cfg(feature = "async")]
pub async fn write_framed_async<W>(writer: &mut W, framed_bytes: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(framed_bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read one frame from an async reader
///
/// Returns the complete frame (length prefix included), ready for
/// [`decode_framed`].
#[cfg(feature = "async")]
pub async fn read_framed_async<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    check_frame_size(length)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;

    let mut frame = Vec::with_capacity(4 + length);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&message_bytes);
    Ok(frame)
}
