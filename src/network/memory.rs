//! In-process transport. Every bound identity gets a mailbox; links are pairs
//! of handles sharing a closed flag. Delivery is immediate and ordered per
//! link, which is all the session layer assumes of a real transport.

use crate::model::PeerId;
use crate::network::transport::{
    Link, LinkError, LinkId, Transport, TransportError, TransportEvent, TransportEventSender,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happens when dialing an identity nobody has bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownPeer {
    /// The dialer gets an `Error { PeerUnavailable }` event right away.
    #[default]
    Unavailable,
    /// Nothing happens; the dialer only finds out through its own timeout.
    Silent,
}

#[derive(Debug)]
struct LinkPair {
    closed: AtomicBool,
    /// (owner, link id) for the dialer end and the acceptor end.
    ends: [(PeerId, LinkId); 2],
}

impl LinkPair {
    fn own(&self, link: LinkId) -> &(PeerId, LinkId) {
        if self.ends[0].1 == link {
            &self.ends[0]
        } else {
            &self.ends[1]
        }
    }

    /// The end opposite to `link`.
    fn other(&self, link: LinkId) -> &(PeerId, LinkId) {
        if self.ends[0].1 == link {
            &self.ends[1]
        } else {
            &self.ends[0]
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    mailboxes: HashMap<PeerId, TransportEventSender>,
    pairs: Vec<Arc<LinkPair>>,
    unknown_peer: UnknownPeer,
    offline: bool,
}

impl NetworkInner {
    fn deliver(&self, to: &PeerId, event: TransportEvent) -> bool {
        match self.mailboxes.get(to) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Close `pair` and tell the end opposite to `from` about it.
    fn close_pair(&mut self, pair: &Arc<LinkPair>, from: LinkId) {
        if pair.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (me, _) = pair.own(from).clone();
        let (other, other_link) = pair.other(from).clone();
        self.deliver(
            &other,
            TransportEvent::Closed {
                link: other_link,
                peer: me,
            },
        );
        self.pairs.retain(|p| !Arc::ptr_eq(p, pair));
    }
}

/// Shared handle to one simulated network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryNetwork")
            .field("bound", &inner.mailboxes.len())
            .field("links", &inner.pairs.len())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unknown_peer(unknown_peer: UnknownPeer) -> Self {
        let net = Self::default();
        net.inner.lock().unknown_peer = unknown_peer;
        net
    }

    /// While offline, `bind` and `connect` fail.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    pub fn is_bound(&self, id: &PeerId) -> bool {
        self.inner.lock().mailboxes.contains_key(id)
    }

    pub fn open_links(&self) -> usize {
        self.inner.lock().pairs.len()
    }

    /// Drop `id` off the network without any goodbye: its mailbox disappears
    /// and every remote end of its links observes `Closed`.
    pub fn crash(&self, id: &PeerId) {
        let mut inner = self.inner.lock();
        inner.mailboxes.remove(id);
        let affected: Vec<(Arc<LinkPair>, LinkId)> = inner
            .pairs
            .iter()
            .filter_map(|p| {
                p.ends
                    .iter()
                    .find(|(owner, _)| owner == id)
                    .map(|(_, link)| (Arc::clone(p), *link))
            })
            .collect();
        for (pair, link) in affected {
            inner.close_pair(&pair, link);
        }
        log::debug!("Memory network: {id} crashed");
    }
}

impl Transport for MemoryNetwork {
    fn bind(&self, id: &PeerId, events: TransportEventSender) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(TransportError::Offline("memory network is offline".into()));
        }
        if inner.mailboxes.contains_key(id) {
            return Err(TransportError::AlreadyBound(id.clone()));
        }
        inner.mailboxes.insert(id.clone(), events);
        log::debug!("Memory network: bound {id}");
        Ok(())
    }

    fn unbind(&self, id: &PeerId) {
        self.crash(id);
    }

    fn connect(&self, local: &PeerId, remote: &PeerId) -> Result<Box<dyn Link>, TransportError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(TransportError::Offline("memory network is offline".into()));
        }
        if !inner.mailboxes.contains_key(local) {
            return Err(TransportError::NotBound(local.clone()));
        }

        let local_link = LinkId::next();
        let remote_link = LinkId::next();
        let pair = Arc::new(LinkPair {
            closed: AtomicBool::new(false),
            ends: [(local.clone(), local_link), (remote.clone(), remote_link)],
        });
        let link = MemoryLink {
            id: local_link,
            remote: remote.clone(),
            pair: Arc::clone(&pair),
            network: self.clone(),
        };

        if inner.mailboxes.contains_key(remote) && remote != local {
            inner.pairs.push(Arc::clone(&pair));
            let accepted = MemoryLink {
                id: remote_link,
                remote: local.clone(),
                pair,
                network: self.clone(),
            };
            inner.deliver(remote, TransportEvent::Incoming(Box::new(accepted)));
            inner.deliver(
                remote,
                TransportEvent::Opened {
                    link: remote_link,
                    peer: local.clone(),
                },
            );
            inner.deliver(
                local,
                TransportEvent::Opened {
                    link: local_link,
                    peer: remote.clone(),
                },
            );
        } else {
            pair.closed.store(true, Ordering::SeqCst);
            if inner.unknown_peer == UnknownPeer::Unavailable {
                inner.deliver(
                    local,
                    TransportEvent::Error {
                        link: local_link,
                        peer: remote.clone(),
                        error: LinkError::PeerUnavailable(remote.clone()),
                    },
                );
            }
        }

        Ok(Box::new(link))
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    id: LinkId,
    remote: PeerId,
    pair: Arc<LinkPair>,
    network: MemoryNetwork,
}

impl Link for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        if self.pair.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let (me, _) = self.pair.own(self.id).clone();
        let (_, remote_link) = self.pair.other(self.id);
        let inner = self.network.inner.lock();
        let delivered = inner.deliver(
            &self.remote,
            TransportEvent::Data {
                link: *remote_link,
                peer: me,
                bytes,
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(LinkError::Io(format!("{} is unreachable", self.remote)))
        }
    }

    fn close(&self) -> Result<(), LinkError> {
        let mut inner = self.network.inner.lock();
        inner.close_pair(&self.pair, self.id);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
