//! Contract of the link transport the session layer runs on.
//!
//! A transport hands out bidirectional links to remote identities and reports
//! everything that happens on them as [`TransportEvent`]s on the channel
//! registered with [`Transport::bind`]. Nothing here blocks: `connect` returns
//! a link immediately and its outcome (`Opened` or `Error`) arrives later.

use crate::model::PeerId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of one link. Distinguishes a replaced link from its
/// successor to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),
    #[error("link is closed")]
    Closed,
    #[error("link IO error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("identity {0} is already bound")]
    AlreadyBound(PeerId),
    #[error("transport is offline: {0}")]
    Offline(String),
    #[error("identity {0} is not bound")]
    NotBound(PeerId),
}

/// One transport-level byte stream to exactly one remote identity.
pub trait Link: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;

    fn remote(&self) -> &PeerId;

    /// Queue `bytes` for delivery. Never blocks.
    fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError>;

    /// Close the link. The remote side observes `Closed`; the local side does
    /// not get an event for a close it initiated.
    fn close(&self) -> Result<(), LinkError>;
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A remote peer dialed us. The link is not open yet.
    Incoming(Box<dyn Link>),
    Opened { link: LinkId, peer: PeerId },
    Data { link: LinkId, peer: PeerId, bytes: Vec<u8> },
    Closed { link: LinkId, peer: PeerId },
    Error { link: LinkId, peer: PeerId, error: LinkError },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub trait Transport: Send + Sync {
    /// Claim `id` on the transport; events for links of `id` go to `events`.
    fn bind(&self, id: &PeerId, events: TransportEventSender) -> Result<(), TransportError>;

    /// Release `id`. Open links of `id` are closed.
    fn unbind(&self, id: &PeerId);

    /// Start dialing `remote`. Completion is reported as events.
    fn connect(&self, local: &PeerId, remote: &PeerId) -> Result<Box<dyn Link>, TransportError>;
}
