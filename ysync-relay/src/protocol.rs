//! Sync wire protocol.
//!
//! Frames use lib0 variable-length encoding (the Yjs sync protocol):
//! ```text
//! ┌──────────────────┬───────────────┬─────────────────────────────┐
//! │ messageKind      │ syncKind      │ payload                     │
//! │ varUint          │ varUint       │ varUint length + bytes      │
//! └──────────────────┴───────────────┴─────────────────────────────┘
//!
//! messageKind  0 = sync            syncKind  0 = step 1 (state vector)
//!              1 = awareness                 1 = step 2 (update)
//!              3 = queryAwareness            2 = update
//! ```
//!
//! Awareness frames carry a single length-prefixed payload and no sync
//! kind; queryAwareness frames carry nothing. Frames travel base64-encoded
//! over text transports.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Outer envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Sync = 0,
    Awareness = 1,
    QueryAwareness = 3,
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Sync),
            1 => Ok(MessageKind::Awareness),
            3 => Ok(MessageKind::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Inner kind of a sync envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncKind {
    Step1 = 0,
    Step2 = 1,
    Update = 2,
}

impl TryFrom<u32> for SyncKind {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(SyncKind::Step1),
            1 => Ok(SyncKind::Step2),
            2 => Ok(SyncKind::Update),
            other => Err(ProtocolError::UnknownSyncKind(other)),
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sender's encoded state vector
    SyncStep1(Vec<u8>),
    /// Update answering a step 1
    SyncStep2(Vec<u8>),
    /// Incremental update
    Update(Vec<u8>),
    /// Encoded awareness update
    Awareness(Vec<u8>),
    QueryAwareness,
}

impl Frame {
    pub fn message_kind(&self) -> MessageKind {
        match self {
            Frame::SyncStep1(_) | Frame::SyncStep2(_) | Frame::Update(_) => MessageKind::Sync,
            Frame::Awareness(_) => MessageKind::Awareness,
            Frame::QueryAwareness => MessageKind::QueryAwareness,
        }
    }

    /// Decode a frame from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let kind = MessageKind::try_from(read_tag(&mut cursor)?)?;

        match kind {
            MessageKind::Sync => {
                let sync_kind = SyncKind::try_from(read_tag(&mut cursor)?)?;
                let payload = read_payload(&mut cursor)?;
                Ok(match sync_kind {
                    SyncKind::Step1 => Frame::SyncStep1(payload),
                    SyncKind::Step2 => Frame::SyncStep2(payload),
                    SyncKind::Update => Frame::Update(payload),
                })
            }
            MessageKind::Awareness => Ok(Frame::Awareness(read_payload(&mut cursor)?)),
            MessageKind::QueryAwareness => Ok(Frame::QueryAwareness),
        }
    }

    /// Encode to raw bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_kind() as u32);
        match self {
            Frame::SyncStep1(payload) => {
                buf.write_var(SyncKind::Step1 as u32);
                buf.write_buf(payload);
            }
            Frame::SyncStep2(payload) => {
                buf.write_var(SyncKind::Step2 as u32);
                buf.write_buf(payload);
            }
            Frame::Update(payload) => {
                buf.write_var(SyncKind::Update as u32);
                buf.write_buf(payload);
            }
            Frame::Awareness(payload) => buf.write_buf(payload),
            Frame::QueryAwareness => {}
        }
        buf
    }
}

fn read_tag(cursor: &mut Cursor<'_>) -> Result<u32, ProtocolError> {
    cursor
        .read_var::<u32>()
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn read_payload(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, ProtocolError> {
    cursor
        .read_buf()
        .map(<[u8]>::to_vec)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Base64-encode a frame for a text transport.
pub fn to_transport(frame: &[u8]) -> String {
    STANDARD.encode(frame)
}

/// Decode a base64 transport message into raw frame bytes.
pub fn from_transport(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u32),
    #[error("unknown sync kind: {0}")]
    UnknownSyncKind(u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid awareness update: {0}")]
    InvalidAwareness(String),
    #[error("invalid document update: {0}")]
    InvalidUpdate(String),
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
}
