//! Binary frame codec for document sessions.
//!
//! Wire format: one tag byte followed by the payload.
//!
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ tag u8  │ payload (variable)           │
//! ├─────────┼──────────────────────────────┤
//! │ 0       │ CRDT update (v1 encoding)    │
//! │ 1       │ client state vector (v1)     │
//! │ 2       │ CRDT update: full state/diff │
//! │ 3       │ opaque awareness bytes       │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! Ping/pong ride the WebSocket control frames and never appear here.

use thiserror::Error;

const TAG_UPDATE: u8 = 0;
const TAG_SYNC_REQUEST: u8 = 1;
const TAG_SYNC_REPLY: u8 = 2;
const TAG_AWARENESS: u8 = 3;

/// Frame decode failures. Either one terminates the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
}

/// A decoded session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Incremental CRDT update from a client
    Update(Vec<u8>),
    /// Client asks for a diff against its state vector
    SyncRequest(Vec<u8>),
    /// Server-sent full state or diff
    SyncReply(Vec<u8>),
    /// Ephemeral presence payload, broadcast verbatim
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Self::Update(p) => (TAG_UPDATE, p),
            Self::SyncRequest(p) => (TAG_SYNC_REQUEST, p),
            Self::SyncReply(p) => (TAG_SYNC_REPLY, p),
            Self::Awareness(p) => (TAG_AWARENESS, p),
        };
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(tag);
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        match tag {
            TAG_UPDATE => Ok(Self::Update(payload.to_vec())),
            TAG_SYNC_REQUEST => Ok(Self::SyncRequest(payload.to_vec())),
            TAG_SYNC_REPLY => Ok(Self::SyncReply(payload.to_vec())),
            TAG_AWARENESS => Ok(Self::Awareness(payload.to_vec())),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_frames() {
        let frames = [
            Frame::Update(vec![1, 2, 3]),
            Frame::SyncRequest(vec![]),
            Frame::SyncReply(vec![9; 32]),
            Frame::Awareness(b"cursor".to_vec()),
        ];
        for frame in frames {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(Frame::decode(&[42, 1, 2]), Err(ProtocolError::UnknownTag(42)));
    }

    #[test]
    fn test_tag_layout_is_stable() {
        assert_eq!(Frame::Update(vec![7]).encode(), vec![0, 7]);
        assert_eq!(Frame::SyncRequest(vec![7]).encode(), vec![1, 7]);
        assert_eq!(Frame::SyncReply(vec![7]).encode(), vec![2, 7]);
        assert_eq!(Frame::Awareness(vec![7]).encode(), vec![3, 7]);
    }
}
