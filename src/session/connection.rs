use crate::model::PeerId;
use crate::network::messages::Envelope;
use crate::network::transport::{Link, LinkError, LinkId};
use crate::sync::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ── Link state machine ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl LinkState {
    pub fn can_transition(self, to: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnecting | Disconnected)
                | (Connected, Disconnecting | Disconnected | Error)
                | (Disconnecting, Disconnected)
                | (Error, Disconnecting)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnecting => "disconnecting",
            LinkState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications, returned from the call that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Added { peer: PeerId },
    Opened { peer: PeerId },
    StateChanged { peer: PeerId, from: LinkState, to: LinkState },
    /// The remote side closed the link.
    Closed { peer: PeerId },
    Errored { peer: PeerId, error: LinkError },
    Removed { peer: PeerId },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub error: usize,
}

/// Read-only view of one tracked link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub peer: PeerId,
    pub link: LinkId,
    pub state: LinkState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub retry_count: u32,
}

struct ManagedLink {
    link: Box<dyn Link>,
    state: LinkState,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    retry_count: u32,
}

// ── ConnectionManager ───────────────────────────────────────────────────────

/// Owns every link of the node, one per remote peer id.
pub struct ConnectionManager {
    links: BTreeMap<PeerId, ManagedLink>,
    clock: Arc<dyn Clock>,
}

impl ConnectionManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            links: BTreeMap::new(),
            clock,
        }
    }

    /// Track `link` in state `Connecting`. An existing link to the same peer
    /// is closed and replaced.
    pub fn add_link(&mut self, link: Box<dyn Link>) -> Vec<ConnectionEvent> {
        let peer = link.remote().clone();
        let mut events = Vec::new();

        if self.links.contains_key(&peer) {
            log::warn!("Replacing existing link to {peer}");
            events.extend(self.close_link(&peer));
        }

        let now = self.clock.now();
        log::debug!("Tracking {} to {peer}", link.id());
        self.links.insert(
            peer.clone(),
            ManagedLink {
                link,
                state: LinkState::Disconnected,
                created_at: now,
                last_activity_at: now,
                retry_count: 0,
            },
        );
        events.push(ConnectionEvent::Added { peer: peer.clone() });
        events.extend(self.transition(&peer, LinkState::Connecting));
        events
    }

    pub fn set_retry_count(&mut self, peer: &PeerId, retry_count: u32) {
        if let Some(entry) = self.links.get_mut(peer) {
            entry.retry_count = retry_count;
        }
    }

    /// The transport reported `link` open.
    pub fn on_open(&mut self, peer: &PeerId, link: LinkId) -> Vec<ConnectionEvent> {
        if !self.is_current(peer, link) {
            log::debug!("Ignoring open of stale {link} to {peer}");
            return Vec::new();
        }
        self.touch(peer);
        let mut events = self.transition(peer, LinkState::Connected);
        if self.state(peer) == LinkState::Connected {
            log::info!("Link to {peer} open");
            events.push(ConnectionEvent::Opened { peer: peer.clone() });
        }
        events
    }

    /// Inbound data on `link`. Returns `false` for a link we do not track.
    pub fn on_data(&mut self, peer: &PeerId, link: LinkId) -> bool {
        if !self.is_current(peer, link) {
            return false;
        }
        self.touch(peer);
        true
    }

    /// The remote closed `link`. The entry is dropped.
    pub fn on_close(&mut self, peer: &PeerId, link: LinkId) -> Vec<ConnectionEvent> {
        if !self.is_current(peer, link) {
            log::debug!("Ignoring close of stale {link} to {peer}");
            return Vec::new();
        }
        log::info!("Link to {peer} closed by remote");
        let mut events = self.transition(peer, LinkState::Disconnected);
        events.push(ConnectionEvent::Closed { peer: peer.clone() });
        if self.links.remove(peer).is_some() {
            events.push(ConnectionEvent::Removed { peer: peer.clone() });
        }
        events
    }

    /// The transport reported an error on `link`. The entry stays in
    /// `Error` until the owner closes it.
    pub fn on_error(&mut self, peer: &PeerId, link: LinkId, error: LinkError) -> Vec<ConnectionEvent> {
        if !self.is_current(peer, link) {
            log::debug!("Ignoring error on stale {link} to {peer}: {error}");
            return Vec::new();
        }
        log::warn!("Link to {peer} failed: {error}");
        let mut events = self.transition(peer, LinkState::Error);
        events.push(ConnectionEvent::Errored {
            peer: peer.clone(),
            error,
        });
        events
    }

    /// Send to one connected peer. Returns `false` when the link is absent or
    /// not connected, or when the transmit fails (the link then goes to `Error`).
    pub fn send(&mut self, peer: &PeerId, envelope: &Envelope) -> bool {
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("Failed to encode {}: {e}", envelope.kind());
                return false;
            }
        };
        self.send_bytes(peer, bytes, envelope)
    }

    /// Send to every connected peer not in `exclude`. Returns the number of
    /// successful sends.
    pub fn broadcast(&mut self, envelope: &Envelope, exclude: &[PeerId]) -> usize {
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("Failed to encode {}: {e}", envelope.kind());
                return 0;
            }
        };
        let targets: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(peer, entry)| entry.state == LinkState::Connected && !exclude.contains(peer))
            .map(|(peer, _)| peer.clone())
            .collect();

        let sent = targets
            .iter()
            .filter(|peer| self.send_bytes(peer, bytes.clone(), envelope))
            .count();
        log::debug!("Broadcast {} to {sent}/{} peers", envelope.kind(), targets.len());
        sent
    }

    fn send_bytes(&mut self, peer: &PeerId, bytes: Vec<u8>, envelope: &Envelope) -> bool {
        let Some(entry) = self.links.get(peer) else {
            log::warn!("Cannot send {} to {peer}: no link", envelope.kind());
            return false;
        };
        if entry.state != LinkState::Connected {
            log::warn!("Cannot send {} to {peer}: link is {}", envelope.kind(), entry.state);
            return false;
        }
        match entry.link.send(bytes) {
            Ok(()) => {
                log::debug!("Sent {} to {peer}", envelope.kind());
                self.touch(peer);
                true
            }
            Err(e) => {
                log::warn!("Send {} to {peer} failed: {e}", envelope.kind());
                self.transition(peer, LinkState::Error);
                false
            }
        }
    }

    /// Close and forget the link to `peer`. Close failures are logged.
    pub fn close_link(&mut self, peer: &PeerId) -> Vec<ConnectionEvent> {
        if !self.links.contains_key(peer) {
            return Vec::new();
        }
        let mut events = self.transition(peer, LinkState::Disconnecting);
        if let Some(entry) = self.links.get(peer) {
            if let Err(e) = entry.link.close() {
                log::warn!("Error closing link to {peer}: {e}");
            }
        }
        events.extend(self.transition(peer, LinkState::Disconnected));
        self.links.remove(peer);
        log::info!("Link to {peer} removed");
        events.push(ConnectionEvent::Removed { peer: peer.clone() });
        events
    }

    pub fn close_all(&mut self) -> Vec<ConnectionEvent> {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.iter().flat_map(|peer| self.close_link(peer)).collect()
    }

    /// Close every link idle for longer than `timeout`. Returns the reaped
    /// peers; their count is the number reaped.
    pub fn reap_idle(&mut self, timeout: Duration) -> Vec<PeerId> {
        let idle: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, entry)| self.clock.since(entry.last_activity_at) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in &idle {
            log::info!("Reaping idle link to {peer}");
            self.close_link(peer);
        }
        idle
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// `Disconnected` for an untracked peer.
    pub fn state(&self, peer: &PeerId) -> LinkState {
        self.links
            .get(peer)
            .map_or(LinkState::Disconnected, |entry| entry.state)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state(peer) == LinkState::Connected
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn link_id(&self, peer: &PeerId) -> Option<LinkId> {
        self.links.get(peer).map(|entry| entry.link.id())
    }

    pub fn info(&self) -> Vec<LinkInfo> {
        self.links
            .iter()
            .map(|(peer, entry)| LinkInfo {
                peer: peer.clone(),
                link: entry.link.id(),
                state: entry.state,
                created_at: entry.created_at,
                last_activity_at: entry.last_activity_at,
                retry_count: entry.retry_count,
            })
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            total: self.links.len(),
            ..ConnectionStats::default()
        };
        for entry in self.links.values() {
            match entry.state {
                LinkState::Connected => stats.connected += 1,
                LinkState::Connecting => stats.connecting += 1,
                LinkState::Disconnected | LinkState::Disconnecting => stats.disconnected += 1,
                LinkState::Error => stats.error += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn is_current(&self, peer: &PeerId, link: LinkId) -> bool {
        self.link_id(peer) == Some(link)
    }

    fn touch(&mut self, peer: &PeerId) {
        let now = self.clock.now();
        if let Some(entry) = self.links.get_mut(peer) {
            entry.last_activity_at = now;
        }
    }

    fn transition(&mut self, peer: &PeerId, to: LinkState) -> Vec<ConnectionEvent> {
        let Some(entry) = self.links.get_mut(peer) else {
            return Vec::new();
        };
        let from = entry.state;
        if from == to {
            return Vec::new();
        }
        if !from.can_transition(to) {
            log::warn!("Illegal link transition for {peer}: {from} -> {to}");
            return Vec::new();
        }
        entry.state = to;
        log::debug!("Link to {peer}: {from} -> {to}");
        vec![ConnectionEvent::StateChanged {
            peer: peer.clone(),
            from,
            to,
        }]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
