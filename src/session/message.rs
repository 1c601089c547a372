use super::{Core, SessionEvent};
use crate::model::{ChatMessage, PeerId, Room, Sender};
use crate::network::messages::Envelope;

/// Append a locally synthesized system line and announce it.
pub(crate) fn append_system(room: &mut Room, core: &Core, text: impl Into<String>) -> ChatMessage {
    let message = ChatMessage::system(text, core.now());
    room.push_message(message.clone());
    core.emit(SessionEvent::MessageAdded(message.clone()));
    message
}

/// Host side: deliver `envelope` to every member of `room` except `skip`.
/// Returns the number of successful sends.
pub(crate) fn send_to_members(
    room: &Room,
    core: &mut Core,
    envelope: &Envelope,
    skip: Option<&PeerId>,
) -> usize {
    let mut delivered = 0;
    for user in &room.users {
        if user.id == room.id || skip == Some(&user.id) {
            continue;
        }
        if core.connections.send(&user.id, envelope) {
            delivered += 1;
        }
    }
    delivered
}

/// Echo `content` locally, then deliver it: the host fans out to every
/// member, a member hands it to the host.
pub(crate) fn send_message(
    room: Option<&mut Room>,
    core: &mut Core,
    content: &str,
) -> Option<ChatMessage> {
    if content.trim().is_empty() {
        log::debug!("Ignoring blank message");
        return None;
    }
    let Some(room) = room else {
        log::warn!("send_message outside of a room");
        return None;
    };
    let me = core.session.local_user()?;

    let message = ChatMessage::from_peer(
        me.id,
        me.display_name,
        content,
        core.now(),
        Some(room.id.clone()),
    );
    room.push_message(message.clone());
    core.emit(SessionEvent::MessageAdded(message.clone()));

    let envelope = Envelope::Message(message.clone());
    let delivered = if room.is_host() {
        send_to_members(room, core, &envelope, None)
    } else {
        usize::from(core.connections.send(room.host_id(), &envelope))
    };
    if delivered == 0 {
        log::warn!("Message {} kept locally, no one to deliver to", message.id);
    }
    Some(message)
}

/// Inbound `MESSAGE`. Members only accept it from their host; the host only
/// accepts a member's own messages and relays them to everyone else.
pub(crate) fn on_message(
    room: Option<&mut Room>,
    core: &mut Core,
    origin: &PeerId,
    message: ChatMessage,
) {
    let Some(room) = room else {
        log::debug!("MESSAGE from {origin} outside of a room, dropping");
        return;
    };
    if message.room_id.as_ref().is_some_and(|id| id != &room.id) {
        log::warn!("MESSAGE from {origin} addressed to another room, dropping");
        return;
    }
    if room.has_message(&message.id) {
        log::debug!("Duplicate message {} from {origin}", message.id);
        return;
    }

    if room.is_host() {
        if !room.contains(origin) {
            log::warn!("MESSAGE from {origin}, who is not in the room");
            return;
        }
        if matches!(&message.sender, Sender::Peer(sender) if sender != origin) {
            log::warn!("MESSAGE from {origin} claims another sender, dropping");
            return;
        }
    } else if !room.synced || room.host_id() != origin {
        log::debug!("MESSAGE from {origin} before sync or not from host, dropping");
        return;
    }

    room.push_message(message.clone());
    core.emit(SessionEvent::MessageAdded(message.clone()));

    if room.is_host() {
        let relayed = send_to_members(room, core, &Envelope::Message(message), Some(origin));
        log::debug!("Relayed message from {origin} to {relayed} member(s)");
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{ChatMessage, PeerId};
    use crate::network::messages::Envelope;
    use crate::session::testkit::TestNet;
    use crate::session::SessionEvent;
    use chrono::Utc;

    fn messages(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::MessageAdded(m) if !m.is_system() => Some(m.content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_blank_message_ignored() {
        let mut net = TestNet::new();
        let (h, _members) = net.room_with_members("alice", &["bob"]);
        let before = net.node(h).history().len();
        assert!(net.node(h).send_message("   ").is_none());
        assert_eq!(net.node(h).history().len(), before);
    }

    #[test]
    fn test_send_without_room() {
        let mut net = TestNet::new();
        let n = net.started("alice");
        assert!(net.node(n).send_message("hello").is_none());
        assert!(net.node(n).history().is_empty());
    }

    #[test]
    fn test_member_message_relayed_to_others() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob", "carol"]);
        let (bob, carol) = (members[0], members[1]);
        for n in [h, bob, carol] {
            net.take_events(n);
        }

        let sent = net.node(bob).send_message("hi all").unwrap();
        net.pump();

        assert_eq!(messages(&net.take_events(bob)), vec!["hi all"]);
        assert_eq!(messages(&net.take_events(h)), vec!["hi all"]);
        assert_eq!(messages(&net.take_events(carol)), vec!["hi all"]);
        assert_eq!(net.node(carol).history().last().unwrap().id, sent.id);
        assert_eq!(
            net.node(carol).current_room().unwrap().last_message.as_ref().unwrap().content,
            "hi all"
        );
    }

    #[test]
    fn test_duplicate_message_dropped() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob"]);
        let bob = members[0];
        let sent = net.node(h).send_message("once").unwrap();
        net.pump();
        net.take_events(bob);

        net.deliver_from(h, bob, &Envelope::Message(sent));
        assert!(messages(&net.take_events(bob)).is_empty());
        let count = net
            .node(bob)
            .history()
            .iter()
            .filter(|m| m.content == "once")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_host_drops_forged_sender() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob", "carol"]);
        let (bob, carol) = (members[0], members[1]);
        let h_id = net.id(h);
        let carol_id = net.id(carol);
        net.take_events(h);

        let forged = ChatMessage::from_peer(carol_id, "carol", "not me", Utc::now(), Some(h_id));
        net.deliver_from(bob, h, &Envelope::Message(forged));

        assert!(messages(&net.take_events(h)).is_empty());
        assert!(!net.node(carol).history().iter().any(|m| m.content == "not me"));
    }

    #[test]
    fn test_message_for_other_room_dropped() {
        let mut net = TestNet::new();
        let (h, members) = net.room_with_members("alice", &["bob"]);
        let bob = members[0];
        net.take_events(bob);

        let stray = ChatMessage::from_peer(
            net.id(h),
            "alice",
            "elsewhere",
            Utc::now(),
            Some(PeerId::new("user_otherroom")),
        );
        net.deliver_from(h, bob, &Envelope::Message(stray));
        assert!(messages(&net.take_events(bob)).is_empty());
    }

    #[test]
    fn test_message_while_alone_kept_locally() {
        let mut net = TestNet::new();
        let (h, _) = net.room_with_members("alice", &[]);
        let sent = net.node(h).send_message("echo").unwrap();
        assert_eq!(net.node(h).history().last(), Some(&sent));
        assert_eq!(sent.sender_name.as_deref(), Some("alice"));
        assert_eq!(sent.room_id, Some(net.id(h)));
    }
}
