//! IPC protocol between the bus and an isolation boundary
//!
//! Frames are `[len: u32 BE][msg_type: u8][payload]`, where `len` counts the
//! type byte plus the payload. Payloads are JSON. Requests carry an `id` that
//! the matching [`Reply`] echoes, so several calls can be in flight at once.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::activator::ActivatorError;
use crate::envelope::Envelope;
use crate::handler::{Disposition, HandlerError, HandlerInfo};

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// IPC Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Message types for IPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Bus → Boundary
    Activate = 1,
    CanProcess = 2,
    Process = 3,
    Release = 4,
    Shutdown = 5,

    // Boundary → Bus
    Ready = 10,
    Reply = 11,
    Event = 12,
    Fault = 13,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Activate),
            2 => Ok(MessageType::CanProcess),
            3 => Ok(MessageType::Process),
            4 => Ok(MessageType::Release),
            5 => Ok(MessageType::Shutdown),
            10 => Ok(MessageType::Ready),
            11 => Ok(MessageType::Reply),
            12 => Ok(MessageType::Event),
            13 => Ok(MessageType::Fault),
            other => Err(IpcError::UnknownMessageType(other)),
        }
    }
}

/// A single frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self, IpcError> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub id: u64,
    pub type_name: String,
    #[serde(default)]
    pub contract: Option<String>,
}

/// Body of `CanProcess` and `Process` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub id: u64,
    pub handle: u64,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub id: u64,
    pub handle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Activated { handle: u64, info: HandlerInfo },
    ActivationFailed { error: ActivatorError },
    Eligible { eligible: bool },
    Processed { outcome: Result<Disposition, HandlerError> },
    Released,
    Error { message: String },
}

/// Sent when something inside the boundary went wrong badly enough that the
/// boundary should no longer be trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultReport {
    pub cause: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Framed I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Writes frames to any async byte sink.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), IpcError> {
        let len = 1 + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }
        self.inner.write_all(&(len as u32).to_be_bytes()).await?;
        self.inner.write_all(&[frame.msg_type as u8]).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a message with JSON payload
    pub async fn send_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        data: &T,
    ) -> Result<(), IpcError> {
        self.send(&Frame::json(msg_type, data)?).await
    }

    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads frames from any async byte source.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame. `Ok(None)` means the other side closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Frame>, IpcError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let msg_type = MessageType::try_from(type_buf[0])?;

        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame::new(msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.send(&Frame::empty(MessageType::Ready)).await.unwrap();
        writer
            .send_json(
                MessageType::Activate,
                &ActivateRequest {
                    id: 7,
                    type_name: "app::Audit".into(),
                    contract: None,
                },
            )
            .await
            .unwrap();
        drop(writer);

        let ready = reader.recv().await.unwrap().unwrap();
        assert_eq!(ready.msg_type, MessageType::Ready);
        assert!(ready.payload.is_empty());

        let activate = reader.recv().await.unwrap().unwrap();
        let request: ActivateRequest = activate.parse_json().unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.type_name, "app::Audit");

        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_and_empty_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&2u32.to_be_bytes()).await.unwrap();
        a.write_all(&[99, 0]).await.unwrap();
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        drop(a);

        let mut reader = FrameReader::new(b);
        assert!(matches!(
            reader.recv().await,
            Err(IpcError::UnknownMessageType(99))
        ));
        // The bad frame's payload byte is still in the stream.
        let mut stray = [0u8; 1];
        reader.inner.read_exact(&mut stray).await.unwrap();
        assert!(matches!(reader.recv().await, Err(IpcError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        let mut reader = FrameReader::new(b);
        assert!(matches!(
            reader.recv().await,
            Err(IpcError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_reply_body_json_shape() {
        let reply = Reply {
            id: 3,
            body: ReplyBody::Processed {
                outcome: Ok(Disposition::Retry),
            },
        };
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"kind\":\"processed\""));
        let back: Reply = serde_json::from_str(&text).unwrap();
        assert_eq!(back.body, reply.body);
    }
}
