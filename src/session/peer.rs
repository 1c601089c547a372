use crate::error::ChatError;
use crate::model::{ChatMessage, PeerId, User};
use crate::network::messages::{CodecError, Envelope, EnvelopeKind, KeepAlive, RoomSnapshot, UserLeft};
use crate::network::transport::{Link, LinkId, Transport, TransportError, TransportEventSender};
use crate::session::connection::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;

// ── Envelope routing ────────────────────────────────────────────────────────

/// One handler per envelope kind. Each receives the payload and the peer id
/// of the link it arrived on.
pub trait EnvelopeHandler {
    fn on_new_user(&mut self, origin: &PeerId, user: User);
    fn on_user_joined(&mut self, origin: &PeerId, user: User);
    fn on_room_state(&mut self, origin: &PeerId, snapshot: RoomSnapshot);
    fn on_user_left(&mut self, origin: &PeerId, left: UserLeft);
    fn on_message(&mut self, origin: &PeerId, message: ChatMessage);
    fn on_keep_alive(&mut self, origin: &PeerId, ping: KeepAlive);
    fn on_keep_alive_ack(&mut self, origin: &PeerId, ack: KeepAlive);
}

/// Decode `bytes` and hand the envelope to its handler. Undecodable input is
/// logged and dropped. Returns the kind that was dispatched.
pub fn route<H: EnvelopeHandler + ?Sized>(
    handler: &mut H,
    origin: &PeerId,
    bytes: &[u8],
) -> Option<EnvelopeKind> {
    let envelope = match Envelope::decode(bytes) {
        Ok(env) => env,
        Err(CodecError::UnknownKind(kind)) => {
            log::warn!("Dropping envelope of unknown kind {kind:?} from {origin}");
            return None;
        }
        Err(e) => {
            log::warn!("Dropping malformed envelope from {origin}: {e}");
            return None;
        }
    };

    let kind = envelope.kind();
    log::debug!("{origin} -> {kind}");
    match envelope {
        Envelope::NewUser(user) => handler.on_new_user(origin, user),
        Envelope::UserJoined(user) => handler.on_user_joined(origin, user),
        Envelope::RoomState(snapshot) => handler.on_room_state(origin, snapshot),
        Envelope::UserLeft(left) => handler.on_user_left(origin, left),
        Envelope::Message(message) => handler.on_message(origin, message),
        Envelope::KeepAlive(ping) => handler.on_keep_alive(origin, ping),
        Envelope::KeepAliveAck(ack) => handler.on_keep_alive_ack(origin, ack),
    }
    Some(kind)
}

// ── PeerSession ─────────────────────────────────────────────────────────────

/// Local identity on the transport, plus inbound links that have not opened
/// yet.
pub struct PeerSession {
    transport: Arc<dyn Transport>,
    inbox: TransportEventSender,
    identity: Option<User>,
    pending: HashMap<LinkId, Box<dyn Link>>,
}

impl PeerSession {
    /// `inbox` receives the transport events of every identity this session
    /// binds.
    pub fn new(transport: Arc<dyn Transport>, inbox: TransportEventSender) -> Self {
        Self {
            transport,
            inbox,
            identity: None,
            pending: HashMap::new(),
        }
    }

    /// Bind a fresh identity for `display_name`, tearing down the previous
    /// one and all its links first. Not retried on failure.
    pub fn start(
        &mut self,
        display_name: &str,
        connections: &mut ConnectionManager,
    ) -> Result<PeerId, ChatError> {
        self.start_with_id(display_name, PeerId::generate(), connections)
    }

    /// Like [`PeerSession::start`] with a caller-chosen identity, so a host
    /// can keep its room id across restarts.
    pub fn start_with_id(
        &mut self,
        display_name: &str,
        id: PeerId,
        connections: &mut ConnectionManager,
    ) -> Result<PeerId, ChatError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ChatError::IdentityInitFailed(
                "display name is empty".into(),
            ));
        }

        self.stop(connections);

        self.transport
            .bind(&id, self.inbox.clone())
            .map_err(|e| ChatError::IdentityInitFailed(e.to_string()))?;

        log::info!("Session started as {id} ({display_name})");
        self.identity = Some(User::new(id.clone(), display_name));
        Ok(id)
    }

    /// Drop the identity: close every link and release it on the transport.
    pub fn stop(&mut self, connections: &mut ConnectionManager) {
        connections.close_all();
        for (_, link) in self.pending.drain() {
            let _ = link.close();
        }
        if let Some(old) = self.identity.take() {
            self.transport.unbind(&old.id);
            log::info!("Session {} stopped", old.id);
        }
    }

    pub fn is_started(&self) -> bool {
        self.identity.is_some()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.identity.as_ref().map(|u| &u.id)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.identity.as_ref().map(|u| u.display_name.as_str())
    }

    pub fn local_user(&self) -> Option<User> {
        self.identity.clone()
    }

    /// Rename without changing identity.
    pub fn set_display_name(&mut self, display_name: &str) {
        if let Some(me) = self.identity.as_mut() {
            me.display_name = display_name.trim().to_string();
        }
    }

    /// Start dialing `remote`. The outcome arrives as transport events.
    /// Losing our own binding is reported as an identity failure.
    pub fn connect(&self, remote: &PeerId) -> Result<Box<dyn Link>, ChatError> {
        let local = self.local_id().ok_or(ChatError::SessionNotStarted)?;
        self.transport.connect(local, remote).map_err(|e| match e {
            TransportError::NotBound(_) => ChatError::IdentityInitFailed(e.to_string()),
            _ => ChatError::LinkTransportError(e.to_string()),
        })
    }

    /// Hold an inbound link until the transport reports it open.
    pub fn accept(&mut self, link: Box<dyn Link>) {
        log::debug!("Inbound {} from {} pending", link.id(), link.remote());
        self.pending.insert(link.id(), link);
    }

    /// Claim a pending inbound link once it has opened.
    pub fn take_pending(&mut self, link: LinkId) -> Option<Box<dyn Link>> {
        self.pending.remove(&link)
    }

    /// Forget a pending inbound link that closed or failed before opening.
    pub fn drop_pending(&mut self, link: LinkId) -> bool {
        self.pending.remove(&link).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::transport::TransportEvent;
    use crate::sync::clock::ManualClock;
    use chrono::Utc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(EnvelopeKind, PeerId)>,
    }

    impl EnvelopeHandler for Recorder {
        fn on_new_user(&mut self, origin: &PeerId, _user: User) {
            self.seen.push((EnvelopeKind::NewUser, origin.clone()));
        }
        fn on_user_joined(&mut self, origin: &PeerId, _user: User) {
            self.seen.push((EnvelopeKind::UserJoined, origin.clone()));
        }
        fn on_room_state(&mut self, origin: &PeerId, _snapshot: RoomSnapshot) {
            self.seen.push((EnvelopeKind::RoomState, origin.clone()));
        }
        fn on_user_left(&mut self, origin: &PeerId, _left: UserLeft) {
            self.seen.push((EnvelopeKind::UserLeft, origin.clone()));
        }
        fn on_message(&mut self, origin: &PeerId, _message: ChatMessage) {
            self.seen.push((EnvelopeKind::Message, origin.clone()));
        }
        fn on_keep_alive(&mut self, origin: &PeerId, _ping: KeepAlive) {
            self.seen.push((EnvelopeKind::KeepAlive, origin.clone()));
        }
        fn on_keep_alive_ack(&mut self, origin: &PeerId, _ack: KeepAlive) {
            self.seen.push((EnvelopeKind::KeepAliveAck, origin.clone()));
        }
    }

    fn session(net: &MemoryNetwork) -> (PeerSession, ConnectionManager, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(Arc::new(net.clone()), tx);
        let cm = ConnectionManager::new(Arc::new(ManualClock::default()));
        (session, cm, rx)
    }

    #[test]
    fn test_route_dispatches_by_kind() {
        let origin = PeerId::new("user_m");
        let mut rec = Recorder::default();
        let envelopes = [
            Envelope::NewUser(User::new(origin.clone(), "bob")),
            Envelope::KeepAliveAck(KeepAlive { timestamp: Utc::now() }),
            Envelope::Message(ChatMessage::system("x", Utc::now())),
        ];
        for env in &envelopes {
            let kind = route(&mut rec, &origin, &env.encode().unwrap());
            assert_eq!(kind, Some(env.kind()));
        }
        assert_eq!(
            rec.seen,
            vec![
                (EnvelopeKind::NewUser, origin.clone()),
                (EnvelopeKind::KeepAliveAck, origin.clone()),
                (EnvelopeKind::Message, origin),
            ]
        );
    }

    #[test]
    fn test_route_drops_unknown_and_malformed() {
        let origin = PeerId::new("user_m");
        let mut rec = Recorder::default();
        assert_eq!(route(&mut rec, &origin, br#"{"kind":"FILE_CHUNK","payload":{}}"#), None);
        assert_eq!(route(&mut rec, &origin, br#"{"kind":"NEW_USER","payload":42}"#), None);
        assert_eq!(route(&mut rec, &origin, b"\x00\x01"), None);
        assert!(rec.seen.is_empty());
    }

    #[test]
    fn test_start_binds_identity() {
        let net = MemoryNetwork::new();
        let (mut session, mut cm, _rx) = session(&net);
        assert!(!session.is_started());

        let id = session.start("  alice ", &mut cm).unwrap();
        assert!(net.is_bound(&id));
        assert_eq!(session.local_id(), Some(&id));
        assert_eq!(session.display_name(), Some("alice"));
    }

    #[test]
    fn test_restart_releases_old_identity() {
        let net = MemoryNetwork::new();
        let (mut session, mut cm, _rx) = session(&net);
        let first = session.start("alice", &mut cm).unwrap();
        let second = session.start("alicia", &mut cm).unwrap();

        assert_ne!(first, second);
        assert!(!net.is_bound(&first));
        assert!(net.is_bound(&second));
    }

    #[test]
    fn test_start_with_fixed_id() {
        let net = MemoryNetwork::new();
        let (mut alice, mut cm, _rx) = session(&net);
        let id = alice
            .start_with_id("alice", PeerId::new("user_alice01"), &mut cm)
            .unwrap();
        assert_eq!(id, PeerId::new("user_alice01"));
        assert!(net.is_bound(&id));

        // A second session cannot claim the same identity.
        let (mut other, mut other_cm, _other_rx) = session(&net);
        assert!(matches!(
            other.start_with_id("mallory", PeerId::new("user_alice01"), &mut other_cm),
            Err(ChatError::IdentityInitFailed(_))
        ));
    }

    #[test]
    fn test_start_offline_fails() {
        let net = MemoryNetwork::new();
        net.set_offline(true);
        let (mut session, mut cm, _rx) = session(&net);
        let err = session.start("alice", &mut cm).unwrap_err();
        assert!(matches!(err, ChatError::IdentityInitFailed(_)));
        assert!(!session.is_started());
    }

    #[test]
    fn test_start_requires_name() {
        let net = MemoryNetwork::new();
        let (mut session, mut cm, _rx) = session(&net);
        assert!(matches!(
            session.start("   ", &mut cm),
            Err(ChatError::IdentityInitFailed(_))
        ));
    }

    #[test]
    fn test_connect_requires_start() {
        let net = MemoryNetwork::new();
        let (session, _cm, _rx) = session(&net);
        assert_eq!(
            session.connect(&PeerId::new("user_host")).unwrap_err(),
            ChatError::SessionNotStarted
        );
    }

    #[test]
    fn test_connect_after_losing_binding() {
        let net = MemoryNetwork::new();
        let (mut alice, mut cm, _rx) = session(&net);
        let id = alice.start("alice", &mut cm).unwrap();
        net.crash(&id);
        assert!(matches!(
            alice.connect(&PeerId::new("user_host")),
            Err(ChatError::IdentityInitFailed(_))
        ));
    }

    #[test]
    fn test_pending_inbound_links() {
        let net = MemoryNetwork::new();
        let (mut host, mut cm, mut rx) = session(&net);
        host.start("alice", &mut cm).unwrap();
        let host_id = host.local_id().unwrap().clone();

        let (tx, _member_rx) = mpsc::unbounded_channel();
        net.bind(&PeerId::new("user_m"), tx).unwrap();
        net.connect(&PeerId::new("user_m"), &host_id).unwrap();

        let link = match rx.try_recv().unwrap() {
            TransportEvent::Incoming(link) => link,
            other => panic!("Expected Incoming, got {other:?}"),
        };
        let link_id = link.id();
        host.accept(link);
        assert_eq!(host.pending_count(), 1);

        let claimed = host.take_pending(link_id).unwrap();
        assert_eq!(claimed.remote(), &PeerId::new("user_m"));
        assert!(!host.drop_pending(link_id));
        assert_eq!(host.pending_count(), 0);
    }
}
