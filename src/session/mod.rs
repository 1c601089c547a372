pub mod connection;
pub mod message;
pub mod peer;
pub mod retry;
pub mod room;
pub mod room_id;

#[cfg(test)]
pub(crate) mod testkit;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::model::{ChatMessage, PeerId, Room, User};
use crate::network::messages::{KeepAlive, RoomSnapshot, UserLeft};
use crate::network::transport::{Transport, TransportEvent, TransportEventReceiver};
use crate::sync::clock::{Clock, SystemClock};
use crate::sync::scheduler::{Scheduler, TimerEvent, TokioScheduler};
use chrono::{DateTime, Utc};
use connection::{ConnectionEvent, ConnectionManager, ConnectionStats, LinkInfo};
use peer::{route, EnvelopeHandler, PeerSession};
use retry::RetryPolicy;
use room::RoomService;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ── Session Event ───────────────────────────────────────────────────────────

/// Events emitted by the session layer to the application / UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The local identity is bound and usable.
    Ready { id: PeerId },
    RoomCreated { room_id: PeerId, share_link: String },
    /// The room's membership and history are in sync with the host (or we
    /// switched to a room we were already in).
    Joined { room_id: PeerId, users: Vec<User> },
    Left { room_id: PeerId },
    UserJoined(User),
    UserLeft(User),
    /// A message was appended to a room's history.
    MessageAdded(ChatMessage),
    /// Member side: the link to the host is gone. The room stays readable.
    HostDisconnected { room_id: PeerId },
    Error(ChatError),
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

// ── Core ────────────────────────────────────────────────────────────────────

/// Everything the services share: identity, links, timers, time, and the
/// outbound event channel.
pub(crate) struct Core {
    pub(crate) config: ChatConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) session: PeerSession,
    pub(crate) connections: ConnectionManager,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    events: SessionEventSender,
}

impl Core {
    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Session event dropped, no observer");
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

// ── ChatNode ────────────────────────────────────────────────────────────────

/// Inputs and outputs of a [`ChatNode`] besides its method calls.
pub struct NodeChannels {
    /// Transport events to feed back into [`ChatNode::handle_transport`].
    pub transport: TransportEventReceiver,
    pub events: SessionEventReceiver,
}

/// Read-only copy of a node's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub local_id: Option<PeerId>,
    pub display_name: Option<String>,
    /// The current room.
    pub room: Option<Room>,
    pub rooms: Vec<Room>,
    pub connecting: bool,
    pub connections: Vec<LinkInfo>,
}

/// One chat peer. A synchronous state machine: every method runs to
/// completion without blocking, and completions arrive later as transport
/// or timer events.
pub struct ChatNode {
    core: Core,
    rooms: RoomService,
}

impl ChatNode {
    pub fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> (Self, NodeChannels) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = Core {
            retry: RetryPolicy::from_config(&config),
            config,
            session: PeerSession::new(transport, transport_tx),
            connections: ConnectionManager::new(Arc::clone(&clock)),
            scheduler,
            clock,
            events: events_tx,
        };
        let node = Self {
            core,
            rooms: RoomService::new(),
        };
        (
            node,
            NodeChannels {
                transport: transport_rx,
                events: events_rx,
            },
        )
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// (Re)initialize the local identity. Emits `Ready` or `Error`.
    pub fn start(&mut self, display_name: &str) -> Option<PeerId> {
        self.start_with_id(display_name, PeerId::generate())
    }

    /// Start under a fixed identity instead of a generated one.
    pub fn start_with_id(&mut self, display_name: &str, id: PeerId) -> Option<PeerId> {
        self.rooms.leave_all(&mut self.core);
        let started = self
            .core
            .session
            .start_with_id(display_name, id, &mut self.core.connections);
        match started {
            Ok(id) => {
                self.core.emit(SessionEvent::Ready { id: id.clone() });
                self.rooms.on_session_started(&mut self.core);
                Some(id)
            }
            Err(e) => {
                log::error!("Failed to start session: {e}");
                self.core.emit(SessionEvent::Error(e));
                None
            }
        }
    }

    pub fn create_room(&mut self, display_name: &str) {
        self.rooms.create_room(&mut self.core, display_name);
    }

    /// Accepts a bare room id or a share link. Joining a room we are
    /// already in just makes it current.
    pub fn join_room(&mut self, room: &str) {
        self.rooms.join_room(&mut self.core, room);
    }

    /// Leave the current room only.
    pub fn leave_room(&mut self) {
        self.rooms.leave_room(&mut self.core);
    }

    /// Returns the locally echoed message, if one was appended.
    pub fn send_message(&mut self, content: &str) -> Option<ChatMessage> {
        message::send_message(self.rooms.room_mut(), &mut self.core, content)
    }

    /// Leave every room and release the identity.
    pub fn shutdown(&mut self) {
        self.rooms.leave_all(&mut self.core);
        self.rooms.cancel_all(&mut self.core);
        self.core.session.stop(&mut self.core.connections);
    }

    // ── Inputs ──────────────────────────────────────────────────────────

    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(link) => self.core.session.accept(link),
            TransportEvent::Opened { link, peer } => {
                if let Some(pending) = self.core.session.take_pending(link) {
                    log::info!("Inbound link from {peer} open");
                    let events = self.core.connections.add_link(pending);
                    self.apply(events);
                }
                let events = self.core.connections.on_open(&peer, link);
                self.apply(events);
            }
            TransportEvent::Data { link, peer, bytes } => {
                if !self.core.connections.on_data(&peer, link) {
                    log::debug!("Dropping data on untracked {link} from {peer}");
                    return;
                }
                route(self, &peer, &bytes);
            }
            TransportEvent::Closed { link, peer } => {
                if self.core.session.drop_pending(link) {
                    return;
                }
                let events = self.core.connections.on_close(&peer, link);
                self.apply(events);
            }
            TransportEvent::Error { link, peer, error } => {
                if self.core.session.drop_pending(link) {
                    log::info!("Inbound link from {peer} failed before opening: {error}");
                    return;
                }
                let events = self.core.connections.on_error(&peer, link, error);
                self.apply(events);
            }
        }
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        self.rooms.on_timer(&mut self.core, event);
    }

    /// Returns `false` once the node was asked to shut down.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { display_name, id } => {
                match id {
                    Some(id) => self.start_with_id(&display_name, id),
                    None => self.start(&display_name),
                };
            }
            Command::CreateRoom { display_name } => self.create_room(&display_name),
            Command::JoinRoom { room } => self.join_room(&room),
            Command::LeaveRoom => self.leave_room(),
            Command::SendMessage { content } => {
                self.send_message(&content);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn apply(&mut self, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Opened { peer } => self.rooms.on_link_opened(&mut self.core, &peer),
                ConnectionEvent::Closed { peer } => self.rooms.on_link_closed(&mut self.core, &peer),
                ConnectionEvent::Errored { peer, error } => {
                    self.rooms.on_link_error(&mut self.core, &peer, error)
                }
                ConnectionEvent::Added { .. }
                | ConnectionEvent::StateChanged { .. }
                | ConnectionEvent::Removed { .. } => {}
            }
        }
    }

    // ── Observation ─────────────────────────────────────────────────────

    pub fn current_room(&self) -> Option<&Room> {
        self.rooms.room()
    }

    /// Every room we are in, current or not.
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.rooms()
    }

    pub fn history(&self) -> &[ChatMessage] {
        self.rooms.room().map_or(&[], |r| r.history.as_slice())
    }

    pub fn is_connecting(&self) -> bool {
        self.rooms.is_connecting()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.core.session.local_id()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.core.session.display_name()
    }

    pub fn connections(&self) -> Vec<LinkInfo> {
        self.core.connections.info()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.core.connections.stats()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.core.config
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            local_id: self.local_id().cloned(),
            display_name: self.display_name().map(str::to_string),
            room: self.current_room().cloned(),
            rooms: self.rooms().cloned().collect(),
            connecting: self.is_connecting(),
            connections: self.connections(),
        }
    }
}

impl EnvelopeHandler for ChatNode {
    fn on_new_user(&mut self, origin: &PeerId, user: User) {
        self.rooms.on_new_user(&mut self.core, origin, user);
    }

    fn on_user_joined(&mut self, origin: &PeerId, user: User) {
        self.rooms.on_user_joined(&mut self.core, origin, user);
    }

    fn on_room_state(&mut self, origin: &PeerId, snapshot: RoomSnapshot) {
        self.rooms.on_room_state(&mut self.core, origin, snapshot);
    }

    fn on_user_left(&mut self, origin: &PeerId, left: UserLeft) {
        self.rooms.on_user_left(&mut self.core, origin, left);
    }

    fn on_message(&mut self, origin: &PeerId, message: ChatMessage) {
        let room = self
            .rooms
            .message_room(&self.core, origin, message.room_id.as_ref());
        message::on_message(room, &mut self.core, origin, message);
    }

    fn on_keep_alive(&mut self, origin: &PeerId, _ping: KeepAlive) {
        self.rooms.on_keep_alive(&mut self.core, origin);
    }

    fn on_keep_alive_ack(&mut self, origin: &PeerId, ack: KeepAlive) {
        log::debug!("Keep-alive ack from {origin} ({})", ack.timestamp);
    }
}

// ── Async driver ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Command {
    /// `id: None` generates a fresh identity.
    Start { display_name: String, id: Option<PeerId> },
    CreateRoom { display_name: String },
    JoinRoom { room: String },
    LeaveRoom,
    SendMessage { content: String },
    Snapshot { reply: oneshot::Sender<NodeSnapshot> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("chat node has stopped")]
pub struct NodeClosed;

/// Handle to a [`ChatNode`] running in its own task.
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
}

/// Run a node on the current tokio runtime with real timers and clock.
pub fn spawn_node(
    config: ChatConfig,
    transport: Arc<dyn Transport>,
) -> (NodeHandle, SessionEventReceiver) {
    let (scheduler, mut timers) = TokioScheduler::new();
    let (mut node, channels) =
        ChatNode::new(config, transport, Box::new(scheduler), Arc::new(SystemClock));
    let NodeChannels {
        transport: mut transport_rx,
        events,
    } = channels;
    let (commands, mut command_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !node.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        node.shutdown();
                        break;
                    }
                },
                Some(event) = transport_rx.recv() => node.handle_transport(event),
                Some(event) = timers.recv() => node.handle_timer(event),
            }
        }
        log::info!("Chat node stopped");
    });

    (NodeHandle { commands, task }, events)
}

impl NodeHandle {
    fn send(&self, command: Command) -> Result<(), NodeClosed> {
        self.commands.send(command).map_err(|_| NodeClosed)
    }

    pub fn start(&self, display_name: &str) -> Result<(), NodeClosed> {
        self.send(Command::Start {
            display_name: display_name.to_string(),
            id: None,
        })
    }

    pub fn start_with_id(&self, display_name: &str, id: PeerId) -> Result<(), NodeClosed> {
        self.send(Command::Start {
            display_name: display_name.to_string(),
            id: Some(id),
        })
    }

    pub fn create_room(&self, display_name: &str) -> Result<(), NodeClosed> {
        self.send(Command::CreateRoom {
            display_name: display_name.to_string(),
        })
    }

    pub fn join_room(&self, room: &str) -> Result<(), NodeClosed> {
        self.send(Command::JoinRoom {
            room: room.to_string(),
        })
    }

    pub fn leave_room(&self) -> Result<(), NodeClosed> {
        self.send(Command::LeaveRoom)
    }

    pub fn send_message(&self, content: &str) -> Result<(), NodeClosed> {
        self.send(Command::SendMessage {
            content: content.to_string(),
        })
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, NodeClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| NodeClosed)
    }

    /// Leave, release the identity and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            log::error!("Chat node task failed: {e}");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testkit::TestNet;
    use super::*;
    use crate::network::memory::{MemoryNetwork, UnknownPeer};
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn users(room: &Room) -> Vec<PeerId> {
        room.users.iter().map(|u| u.id.clone()).collect()
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[test]
    fn test_host_creates_room() {
        let mut net = TestNet::new();
        let h = net.started("alice");
        net.node(h).create_room("alice");
        net.pump();

        let h_id = net.id(h);
        let room = net.node(h).current_room().unwrap().clone();
        assert!(room.is_host());
        assert_eq!(room.id, h_id);
        assert_eq!(room.users, vec![User::new(h_id.clone(), "alice")]);
        assert_eq!(room.name, "alice's room");

        let events = net.take_events(h);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::RoomCreated { room_id, share_link }
                if room_id == &h_id && share_link.ends_with(&format!("?roomId={h_id}"))
        )));
    }

    #[test]
    fn test_member_joins_live_host() {
        let mut net = TestNet::new();
        let h = net.started("alice");
        let m = net.started("bob");
        net.node(h).create_room("alice");
        let h_id = net.id(h);
        let m_id = net.id(m);

        net.node(m).join_room(h_id.as_str());
        assert!(net.node(m).is_connecting());
        net.pump();

        assert!(!net.node(m).is_connecting());
        let m_room = net.node(m).current_room().unwrap().clone();
        assert!(m_room.synced);
        assert_eq!(m_room.role, crate::model::Role::Member { host: h_id.clone() });
        assert_eq!(users(&m_room), vec![h_id.clone(), m_id.clone()]);
        assert_eq!(m_room.name, "alice's room");

        let h_room = net.node(h).current_room().unwrap();
        assert_eq!(users(h_room), vec![h_id.clone(), m_id.clone()]);

        let events = net.take_events(m);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Joined { room_id, .. } if room_id == &h_id)));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
    }

    #[test]
    fn test_join_unreachable_room_fails_once() {
        let mut net = TestNet::with_unknown_peer(UnknownPeer::Silent);
        let m = net.started("bob");
        net.node(m).join_room("user_nonexistent");
        net.pump();
        assert!(net.node(m).is_connecting());

        let config = net.node(m).config().clone();
        let window = config.connect_timeout() * (1 + config.max_join_retries);
        net.advance(window);

        assert!(!net.node(m).is_connecting());
        assert!(net.node(m).current_room().is_none());
        let errors: Vec<ChatError> = net
            .take_events(m)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![ChatError::LinkTimeout(PeerId::new("user_nonexistent"))]
        );

        // Nothing further fires once the join gave up.
        net.advance(Duration::from_secs(120));
        assert!(net.take_events(m).is_empty());
        assert!(net.node(m).connections().is_empty());
    }

    #[test]
    fn test_host_message_reaches_all_members() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob", "carol"]);

        let sent = net.node(h).send_message("hello").unwrap();
        assert_eq!(net.node(h).history().last(), Some(&sent));
        net.pump();

        for m in members {
            let last = net.node(m).history().last().unwrap().clone();
            assert_eq!(last.content, "hello");
            assert_eq!(last.id, sent.id);
        }
    }

    #[test]
    fn test_unclean_member_disconnect() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob", "carol"]);
        let (bob, carol) = (members[0], members[1]);
        let bob_id = net.id(bob);
        net.take_events(h);

        net.crash(bob);
        net.pump();

        let h_room = net.node(h).current_room().unwrap();
        assert!(!h_room.contains(&bob_id));
        let last = h_room.history.last().unwrap();
        assert!(last.is_system());
        assert!(last.content.contains("bob"));
        assert!(net
            .take_events(h)
            .iter()
            .any(|e| matches!(e, SessionEvent::UserLeft(u) if u.id == bob_id)));

        // The remaining member hears about it through the host.
        assert!(!net.node(carol).current_room().unwrap().contains(&bob_id));
    }

    // ── Properties ──────────────────────────────────────────────────────

    #[test]
    fn test_join_snapshot_matches_host() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob"]);
        net.node(h).send_message("before carol");
        net.node(members[0]).send_message("hi from bob");
        net.pump();

        // Intercept the host state at the moment it produces the snapshot:
        // nothing else happens between NEW_USER and ROOM_STATE in one pump.
        let c = net.started("carol");
        let h_id = net.id(h);
        let c_id = net.id(c);
        net.node(c).join_room(h_id.as_str());
        net.pump();

        let h_room = net.node(h).current_room().unwrap().clone();
        let c_room = net.node(c).current_room().unwrap().clone();
        assert_eq!(c_room.users, h_room.users);
        // The host appended its own "carol joined" line after producing the
        // snapshot; everything before it is identical.
        assert_eq!(c_room.history.as_slice(), &h_room.history[..h_room.history.len() - 1]);
        assert!(h_room.history.last().unwrap().content.contains("carol"));
        assert!(c_room.contains(&c_id));
        assert_eq!(
            c_room.last_message.as_ref().map(|m| m.content.as_str()),
            Some("hi from bob")
        );
    }

    #[test]
    fn test_at_most_one_link_per_peer() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob"]);
        let m = members[0];
        let h_id = net.id(h);

        // Rejoin over a fresh link after a local leave.
        net.node(m).leave_room();
        net.pump();
        net.node(m).join_room(h_id.as_str());
        net.pump();

        for node in [h, m] {
            let infos = net.node(node).connections();
            let mut peers: Vec<&PeerId> = infos.iter().map(|i| &i.peer).collect();
            peers.dedup();
            assert_eq!(peers.len(), infos.len());
        }
        assert_eq!(net.node(h).connection_stats().connected, 1);
        assert_eq!(net.node(h).current_room().unwrap().users.len(), 2);
    }

    #[test]
    fn test_start_failure_reports_identity_error() {
        let mut net = TestNet::new();
        net.network().set_offline(true);
        let n = net.add_node();
        assert!(net.node(n).start("alice").is_none());
        net.pump();
        assert!(matches!(
            net.take_events(n).as_slice(),
            [SessionEvent::Error(ChatError::IdentityInitFailed(_))]
        ));
    }

    #[test]
    fn test_restart_leaves_room() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob"]);
        let bob = members[0];
        let old_id = net.id(bob);
        net.take_events(bob);

        net.node(bob).start("robert");
        net.pump();

        assert_ne!(net.id(bob), old_id);
        assert!(net.node(bob).current_room().is_none());
        assert!(!net.node(h).current_room().unwrap().contains(&old_id));
        let events = net.take_events(bob);
        assert!(matches!(events[0], SessionEvent::Left { .. }));
        assert!(matches!(events[1], SessionEvent::Ready { .. }));
    }

    #[test]
    fn test_shutdown_releases_identity() {
        let mut net = TestNet::new();
        let (h, _members) = net.room_with_members("alice", &["bob"]);
        let h_id = net.id(h);
        net.node(h).shutdown();
        net.pump();
        assert!(!net.network().is_bound(&h_id));
        assert!(net.node(h).local_id().is_none());
    }

    // ── Async driver ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_spawned_nodes_chat() {
        let network = MemoryNetwork::new();
        let (host, mut host_events) = spawn_node(ChatConfig::default(), Arc::new(network.clone()));
        let (member, mut member_events) =
            spawn_node(ChatConfig::default(), Arc::new(network.clone()));

        host.start("alice").unwrap();
        let host_id = match timeout(TEST_TIMEOUT, host_events.recv()).await.unwrap() {
            Some(SessionEvent::Ready { id }) => id,
            other => panic!("Expected Ready, got {other:?}"),
        };
        host.create_room("alice").unwrap();

        member.start("bob").unwrap();
        member.join_room(&format!("http://localhost:5173/?roomId={host_id}")).unwrap();

        timeout(TEST_TIMEOUT, async {
            while let Some(event) = member_events.recv().await {
                if matches!(event, SessionEvent::Joined { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        member.send_message("hi alice").unwrap();
        timeout(TEST_TIMEOUT, async {
            while let Some(event) = host_events.recv().await {
                if matches!(&event, SessionEvent::MessageAdded(m) if m.content == "hi alice") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let snapshot = host.snapshot().await.unwrap();
        assert_eq!(snapshot.room.unwrap().users.len(), 2);
        assert_eq!(snapshot.local_id, Some(host_id));

        member.shutdown().await;
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_reports_closed_node() {
        let (handle, _events) = spawn_node(ChatConfig::default(), Arc::new(MemoryNetwork::new()));
        let commands = handle.commands.clone();
        handle.shutdown().await;
        assert!(commands.send(Command::LeaveRoom).is_err());
    }
}
