use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ── Constants ───────────────────────────────────────────────────────────────

/// Wire value of [`Sender::System`].
pub const SYSTEM_SENDER: &str = "system";

/// Display name attached to locally synthesized system messages.
pub const SYSTEM_NAME: &str = "System";

/// Placeholder name for the host until its `ROOM_STATE` arrives.
pub const UNRESOLVED_HOST_NAME: &str = "Waiting for host...";

const GENERATED_ID_PREFIX: &str = "user_";
const GENERATED_ID_LEN: usize = 10;

// ── Identity ────────────────────────────────────────────────────────────────

/// Opaque transport identity of a peer. Immutable for the session lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh local identity: `user_` followed by ten alphanumeric characters.
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_ID_LEN)
            .map(char::from)
            .collect();
        Self(format!("{GENERATED_ID_PREFIX}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Users & messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: PeerId,
    pub display_name: String,
}

impl User {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Author of a chat message. Serialized as `"system"` or the peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sender {
    System,
    Peer(PeerId),
}

impl From<String> for Sender {
    fn from(s: String) -> Self {
        if s == SYSTEM_SENDER {
            Sender::System
        } else {
            Sender::Peer(PeerId(s))
        }
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::System => SYSTEM_SENDER.to_string(),
            Sender::Peer(id) => id.0,
        }
    }
}

/// A single chat line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<PeerId>,
}

impl ChatMessage {
    pub fn from_peer(
        sender: PeerId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        room_id: Option<PeerId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Sender::Peer(sender),
            sender_name: Some(sender_name.into()),
            content: content.into(),
            timestamp,
            room_id,
        }
    }

    pub fn system(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Sender::System,
            sender_name: Some(SYSTEM_NAME.to_string()),
            content: content.into(),
            timestamp,
            room_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self.sender, Sender::System)
    }
}

/// Summary of the most recent chat message, shown in room lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ── Room ────────────────────────────────────────────────────────────────────

/// Topology role of the local peer within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Our identity is the room id; every member links to us.
    Host,
    /// We hold a single link, to `host`.
    Member { host: PeerId },
}

/// Local view of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    /// Equals the host's identity.
    pub id: PeerId,
    pub name: String,
    pub role: Role,
    /// Join order as observed by the host.
    pub users: Vec<User>,
    /// Append order = arrival order at this peer.
    pub history: Vec<ChatMessage>,
    pub last_message: Option<LastMessage>,
    /// `false` for a member placeholder until `ROOM_STATE` arrives.
    pub synced: bool,
}

impl Room {
    pub fn hosted(host: User) -> Self {
        Self {
            id: host.id.clone(),
            name: format!("{}'s room", host.display_name),
            role: Role::Host,
            users: vec![host],
            history: Vec::new(),
            last_message: None,
            synced: true,
        }
    }

    /// Member-side placeholder: ourselves plus the host, whose name is not
    /// known yet.
    pub fn placeholder(room_id: PeerId, me: User) -> Self {
        let short: String = room_id.as_str().chars().take(6).collect();
        Self {
            name: format!("Room {short}"),
            role: Role::Member {
                host: room_id.clone(),
            },
            users: vec![me, User::new(room_id.clone(), UNRESOLVED_HOST_NAME)],
            id: room_id,
            history: Vec::new(),
            last_message: None,
            synced: false,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host)
    }

    pub fn host_id(&self) -> &PeerId {
        match &self.role {
            Role::Host => &self.id,
            Role::Member { host } => host,
        }
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.users.iter().any(|u| &u.id == id)
    }

    pub fn user(&self, id: &PeerId) -> Option<&User> {
        self.users.iter().find(|u| &u.id == id)
    }

    /// Adds `user` unless its id is already present. Returns whether it was added.
    pub fn add_user(&mut self, user: User) -> bool {
        if self.contains(&user.id) {
            return false;
        }
        self.users.push(user);
        true
    }

    pub fn remove_user(&mut self, id: &PeerId) -> Option<User> {
        let idx = self.users.iter().position(|u| &u.id == id)?;
        Some(self.users.remove(idx))
    }

    pub fn has_message(&self, id: &Uuid) -> bool {
        self.history.iter().any(|m| &m.id == id)
    }

    /// Appends to history. Chat messages also refresh `last_message`.
    pub fn push_message(&mut self, message: ChatMessage) {
        if !message.is_system() {
            self.last_message = Some(LastMessage {
                content: message.content.clone(),
                timestamp: message.timestamp,
            });
        }
        self.history.push(message);
    }

    pub fn share_link(&self, origin: &str) -> String {
        crate::session::room_id::share_link(origin, &self.id)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
