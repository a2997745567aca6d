//! Channel-tagged framing for upgraded streaming connections.
//!
//! After the streaming endpoint switches protocols, both directions carry
//! frames of the form `[channel: u8] [length: u32 BE] [payload]`.
//!
//! Channels follow the remote-command numbering used by kubelet:
//! 0 stdin, 1 stdout, 2 stderr, 3 status, 4 resize.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::exec::TerminalSize;

/// Maximum frame payload size: 64 KiB.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

pub const CHANNEL_STDIN: u8 = 0;
pub const CHANNEL_STDOUT: u8 = 1;
pub const CHANNEL_STDERR: u8 = 2;
pub const CHANNEL_STATUS: u8 = 3;
pub const CHANNEL_RESIZE: u8 = 4;

/// Final status of a streaming session, sent once on the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStatus {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            error: Some(message.into()),
        }
    }
}

/// A parsed stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Stdin(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Status(SessionStatus),
    Resize(TerminalSize),
}

impl StreamFrame {
    fn channel(&self) -> u8 {
        match self {
            Self::Stdin(_) => CHANNEL_STDIN,
            Self::Stdout(_) => CHANNEL_STDOUT,
            Self::Stderr(_) => CHANNEL_STDERR,
            Self::Status(_) => CHANNEL_STATUS,
            Self::Resize(_) => CHANNEL_RESIZE,
        }
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Write one frame. Data frames larger than [`MAX_FRAME_PAYLOAD`] are split.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &StreamFrame) -> io::Result<()> {
    let channel = frame.channel();
    let payload = match frame {
        StreamFrame::Stdin(data) | StreamFrame::Stdout(data) | StreamFrame::Stderr(data) => {
            if data.is_empty() {
                write_raw(w, channel, &[]).await?;
            }
            for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
                write_raw(w, channel, chunk).await?;
            }
            return w.flush().await;
        }
        StreamFrame::Status(status) => serde_json::to_vec(status)
            .map_err(|e| invalid(format!("Failed to serialize status: {}", e)))?,
        StreamFrame::Resize(size) => serde_json::to_vec(size)
            .map_err(|e| invalid(format!("Failed to serialize resize: {}", e)))?,
    };
    write_raw(w, channel, &payload).await?;
    w.flush().await
}

async fn write_raw<W: AsyncWrite + Unpin>(w: &mut W, channel: u8, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    w.write_all(&[channel]).await?;
    w.write_all(&len.to_be_bytes()).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<StreamFrame>> {
    let mut header = [0u8; 5];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let channel = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(invalid(format!(
            "Stream frame too large: {} bytes (max {})",
            len, MAX_FRAME_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }

    let frame = match channel {
        CHANNEL_STDIN => StreamFrame::Stdin(payload),
        CHANNEL_STDOUT => StreamFrame::Stdout(payload),
        CHANNEL_STDERR => StreamFrame::Stderr(payload),
        CHANNEL_STATUS => StreamFrame::Status(
            serde_json::from_slice(&payload)
                .map_err(|e| invalid(format!("Invalid status frame: {}", e)))?,
        ),
        CHANNEL_RESIZE => StreamFrame::Resize(
            serde_json::from_slice(&payload)
                .map_err(|e| invalid(format!("Invalid resize frame: {}", e)))?,
        ),
        other => return Err(invalid(format!("Unknown stream channel: {}", other))),
    };
    Ok(Some(frame))
}
