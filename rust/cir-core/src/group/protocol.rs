// rust/cir-core/src/group/protocol.rs

//! Wire protocol between group members and the group server.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +------------------------+
//! | Length (4 bytes)       |  <- u32 little-endian, payload only
//! +------------------------+
//! | Payload (bincode)      |  <- GroupMessage
//! +------------------------+
//! ```
//!
//! A session is `Join` → `Welcome`, then any number of `Barrier` → `Release`
//! exchanges with increasing epochs, then `Leave`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RuntimeError};

/// Largest accepted payload. Group messages are a few dozen bytes.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Member → server: request to join, with an optional preferred rank.
    Join { hint: Option<u32> },
    /// Server → member: membership granted.
    Welcome {
        rank: u32,
        size: u32,
        session_token: String,
    },
    /// Server → member: join refused.
    Rejected { reason: String },
    /// Member → server: arrived at barrier `epoch` (1-based).
    Barrier { epoch: u64 },
    /// Server → member: every member reached barrier `epoch`.
    Release { epoch: u64 },
    /// Member → server: leaving the group.
    Leave,
}

impl GroupMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self).map_err(|e| {
            RuntimeError::serialization(format!("failed to encode group message: {e}"))
        })?;

        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                RuntimeError::serialization(format!(
                    "group message of {} bytes exceeds frame limit",
                    payload.len()
                ))
            })?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload).map_err(|e| {
            RuntimeError::serialization(format!("failed to decode group message: {e}"))
        })
    }
}

fn frame_len(header: [u8; 4]) -> io::Result<usize> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"),
        ));
    }
    Ok(len as usize)
}

/// Writes one framed message to a blocking stream.
pub fn write_message<W: Write>(writer: &mut W, message: &GroupMessage) -> Result<()> {
    let frame = message.encode()?;
    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|e| RuntimeError::group_with_source("failed to send group message", e))
}

/// Reads one framed message from a blocking stream.
///
/// I/O errors are returned unchanged so callers can tell a read timeout
/// from a closed connection.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<GroupMessage> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;

    let mut payload = vec![0u8; frame_len(header)?];
    reader.read_exact(&mut payload)?;

    GroupMessage::decode(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes one framed message to an async stream.
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &GroupMessage,
) -> Result<()> {
    let frame = message.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| RuntimeError::group_with_source("failed to send group message", e))?;
    writer
        .flush()
        .await
        .map_err(|e| RuntimeError::group_with_source("failed to send group message", e))
}

/// Reads one framed message from an async stream.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_message_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<GroupMessage>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(RuntimeError::group_with_source(
                "failed to read group message",
                e,
            ))
        }
    }

    let len = frame_len(header)
        .map_err(|e| RuntimeError::group_with_source("invalid group frame", e))?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RuntimeError::group_with_source("truncated group message", e))?;

    GroupMessage::decode(&payload).map(Some)
}
