use crate::model::{ChatMessage, PeerId, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Envelopes ───────────────────────────────────────────────────────────────

/// The wire unit exchanged over a link: `{"kind": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    /// Member → host, right after the link opens.
    NewUser(User),
    /// Host → every member except the introducer.
    UserJoined(User),
    /// Host → new member, once per join.
    RoomState(RoomSnapshot),
    UserLeft(UserLeft),
    Message(ChatMessage),
    KeepAlive(KeepAlive),
    KeepAliveAck(KeepAlive),
}

/// Closed set of envelope kinds, for routing logs and decode errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    NewUser,
    UserJoined,
    RoomState,
    UserLeft,
    Message,
    KeepAlive,
    KeepAliveAck,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 7] = [
        EnvelopeKind::NewUser,
        EnvelopeKind::UserJoined,
        EnvelopeKind::RoomState,
        EnvelopeKind::UserLeft,
        EnvelopeKind::Message,
        EnvelopeKind::KeepAlive,
        EnvelopeKind::KeepAliveAck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::NewUser => "NEW_USER",
            EnvelopeKind::UserJoined => "USER_JOINED",
            EnvelopeKind::RoomState => "ROOM_STATE",
            EnvelopeKind::UserLeft => "USER_LEFT",
            EnvelopeKind::Message => "MESSAGE",
            EnvelopeKind::KeepAlive => "KEEP_ALIVE",
            EnvelopeKind::KeepAliveAck => "KEEP_ALIVE_ACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payloads ────────────────────────────────────────────────────────────────

/// Authoritative membership + history handed to a joining member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomSnapshot {
    pub users: Vec<User>,
    pub history: Vec<ChatMessage>,
}

/// `room_id` names the room being left. Peers that omit it mean whichever
/// room they share with the receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepAlive {
    pub timestamp: DateTime<Utc>,
}

// ── Codec ───────────────────────────────────────────────────────────────────

/// Just enough structure to tell an unknown kind from a malformed payload.
#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown envelope kind {0:?}")]
    UnknownKind(String),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::NewUser(_) => EnvelopeKind::NewUser,
            Envelope::UserJoined(_) => EnvelopeKind::UserJoined,
            Envelope::RoomState(_) => EnvelopeKind::RoomState,
            Envelope::UserLeft(_) => EnvelopeKind::UserLeft,
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::KeepAlive(_) => EnvelopeKind::KeepAlive,
            Envelope::KeepAliveAck(_) => EnvelopeKind::KeepAliveAck,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        if EnvelopeKind::parse(&raw.kind).is_none() {
            return Err(CodecError::UnknownKind(raw.kind));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ── Frame Codec ─────────────────────────────────────────────────────────────
//
// Wire format for stream transports: [length: u32 LE][JSON payload]
//
// Message-oriented transports (the in-memory one) carry the JSON bytes as-is.

/// Maximum frame size: 16 MB. Prevents allocation bombs from malformed data.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge(payload.len()))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. EOF before the prefix surfaces as
/// `FrameError::Io` with `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ── Tests ───────────────────────────────────────────────────────────────────
