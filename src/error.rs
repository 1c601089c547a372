use crate::model::PeerId;
use crate::network::transport::LinkError;
use thiserror::Error;

/// Failures surfaced to the UI through [`crate::session::SessionEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The transport refused the local identity. Not retried automatically.
    #[error("failed to initialize identity: {0}")]
    IdentityInitFailed(String),

    /// The room host could not be reached after every retry.
    #[error("room {0} is unavailable, it may no longer exist")]
    LinkUnavailable(PeerId),

    /// Every connect attempt to the room host timed out.
    #[error("timed out connecting to room {0}")]
    LinkTimeout(PeerId),

    #[error("connection error: {0}")]
    LinkTransportError(String),

    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("session not started, set a display name first")]
    SessionNotStarted,

    #[error("not in a room")]
    NoActiveRoom,
}

impl ChatError {
    /// Whether the join procedure may retry after this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatError::LinkUnavailable(_)
                | ChatError::LinkTimeout(_)
                | ChatError::LinkTransportError(_)
        )
    }

    /// Classify a link-level failure against the room we were dialing.
    pub fn from_link(target: &PeerId, error: &LinkError) -> Self {
        match error {
            LinkError::PeerUnavailable(_) => ChatError::LinkUnavailable(target.clone()),
            LinkError::Closed => {
                ChatError::LinkTransportError(format!("link to {target} closed"))
            }
            LinkError::Io(msg) => ChatError::LinkTransportError(msg.clone()),
        }
    }
}
