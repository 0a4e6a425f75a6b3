//! Framed bridge server
//!
//! Reads `Call` messages from a byte stream, runs them through the
//! [`BridgeHandler`] and writes a `Reply` with the same call id. The
//! `escpos-printer serve` command runs this over stdin/stdout.

use crate::bridge::BridgeHandler;
use anyhow::{Context, Result};
use protocol::{
    CURRENT_VERSION, CallId, Message, MessagePayload, MethodResponse, ProtocolError,
    decode_framed, encode_framed, validate_version,
};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Error code for calls sent with an incompatible protocol version
pub const INCOMPATIBLE_VERSION: &str = "INCOMPATIBLE_VERSION";

/// Serve bridge calls until the reader reaches end of stream
///
/// Returns the number of calls answered.
pub async fn serve<R, W>(handler: BridgeHandler, mut reader: R, mut writer: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut answered = 0u64;

    loop {
        let frame = match protocol::read_framed_async(&mut reader).await {
            Ok(frame) => frame,
            Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("Bridge input closed after {} calls", answered);
                break;
            }
            Err(e) => return Err(e).context("Failed to read bridge frame"),
        };

        let message = match decode_framed(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                continue;
            }
        };

        let (id, call) = match message.payload {
            MessagePayload::Call { id, call } => (id, call),
            MessagePayload::Reply { id, .. } => {
                warn!("Unexpected reply {:?} on bridge input", id);
                continue;
            }
        };

        let response = if let Err(e) = validate_version(&message.version) {
            warn!("Rejecting call {:?}: {}", id, e);
            MethodResponse::error(INCOMPATIBLE_VERSION, e.to_string())
        } else {
            let handler = handler.clone();
            tokio::task::spawn_blocking(move || handler.handle(&call))
                .await
                .context("Bridge handler panicked")?
        };

        send_reply(&mut writer, id, response).await?;
        answered += 1;
    }

    Ok(answered)
}

async fn send_reply<W>(writer: &mut W, id: CallId, response: MethodResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("Reply {:?}: {:?}", id, response);
    let reply = Message {
        version: CURRENT_VERSION,
        payload: MessagePayload::Reply { id, response },
    };
    let bytes = encode_framed(&reply)?;
    protocol::write_framed_async(writer, &bytes)
        .await
        .context("Failed to write bridge reply")?;
    Ok(())
}
