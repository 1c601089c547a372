use super::message::{append_system, send_to_members};
use super::retry::{RetryDecision, RetryState};
use super::room_id::canonical_room_id;
use super::{Core, SessionEvent};
use crate::error::ChatError;
use crate::model::{LastMessage, PeerId, Role, Room, User};
use crate::network::messages::{Envelope, KeepAlive, RoomSnapshot, UserLeft};
use crate::network::transport::LinkError;
use crate::sync::scheduler::{TimerEvent, TimerId, TimerKind};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// One join procedure in flight, from the first connect until `ROOM_STATE`
/// or until retries run out.
#[derive(Debug)]
struct JoinAttempt {
    target: PeerId,
    retry: RetryState,
    started_at: DateTime<Utc>,
    /// Covers link establishment and the snapshot handshake.
    timeout: Option<TimerId>,
    retry_timer: Option<TimerId>,
    /// `NEW_USER` was sent on the current link.
    introduced: bool,
}

/// Room lifecycle: create, join with timeout and bounded retry, membership
/// bookkeeping, keep-alive and leave.
///
/// A node can host one room and be a member of any number of others at the
/// same time. They share links: at most one per remote peer, kept open while
/// any room still needs it.
#[derive(Debug, Default)]
pub struct RoomService {
    rooms: BTreeMap<PeerId, Room>,
    /// The room commands act on.
    current: Option<PeerId>,
    /// Member rooms whose host is gone. They stay readable.
    orphaned: BTreeSet<PeerId>,
    join: Option<JoinAttempt>,
    /// Join requested before the session was started.
    pending_join: Option<PeerId>,
    resume_timer: Option<TimerId>,
    keep_alive: Option<TimerId>,
    reaper: Option<TimerId>,
}

impl RoomService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<&Room> {
        self.current.as_ref().and_then(|id| self.rooms.get(id))
    }

    pub fn room_mut(&mut self) -> Option<&mut Room> {
        self.current.as_ref().and_then(|id| self.rooms.get_mut(id))
    }

    /// Every room we are in, including unsynced placeholders.
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn is_connecting(&self) -> bool {
        self.join.is_some()
    }

    /// Room an inbound `MESSAGE` belongs to: the one it names, else the room
    /// `origin` hosts for us, else the room we host.
    pub(crate) fn message_room(
        &mut self,
        core: &Core,
        origin: &PeerId,
        room_id: Option<&PeerId>,
    ) -> Option<&mut Room> {
        let key = match room_id {
            Some(id) => id.clone(),
            None if self.rooms.get(origin).is_some_and(|r| !r.is_host()) => origin.clone(),
            None => core.session.local_id()?.clone(),
        };
        self.rooms.get_mut(&key)
    }

    fn hosted_mut(&mut self, core: &Core) -> Option<&mut Room> {
        let me = core.session.local_id()?;
        self.rooms.get_mut(me).filter(|r| r.is_host())
    }

    /// Some room other than a join in flight still talks to `peer`.
    fn shared_with_rooms(&self, peer: &PeerId) -> bool {
        self.rooms.values().any(|room| match &room.role {
            Role::Host => room.contains(peer),
            Role::Member { host } => host == peer && room.synced && !self.orphaned.contains(host),
        })
    }

    fn link_needed(&self, peer: &PeerId) -> bool {
        self.join.as_ref().is_some_and(|j| &j.target == peer) || self.shared_with_rooms(peer)
    }

    fn release_link(&self, core: &mut Core, peer: &PeerId) {
        if !self.link_needed(peer) {
            core.connections.close_link(peer);
        }
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub(crate) fn create_room(&mut self, core: &mut Core, display_name: &str) {
        if !core.session.is_started() {
            log::warn!("create_room before start");
            core.emit(SessionEvent::Error(ChatError::SessionNotStarted));
            return;
        }
        let name = display_name.trim();
        if !name.is_empty() && core.session.display_name() != Some(name) {
            core.session.set_display_name(name);
        }
        let Some(me) = core.session.local_user() else {
            return;
        };
        self.abandon_join(core);
        if self.rooms.contains_key(&me.id) {
            self.leave(core, &me.id);
        }

        let mut room = Room::hosted(me.clone());
        let share_link = room.share_link(&core.config.share_origin);
        let room_id = room.id.clone();
        log::info!("Room {room_id} created by {}", me.display_name);
        core.emit(SessionEvent::RoomCreated {
            room_id: room_id.clone(),
            share_link,
        });
        append_system(&mut room, core, format!("{} created the room", me.display_name));
        self.rooms.insert(room_id.clone(), room);
        self.current = Some(room_id);

        self.keep_alive = Some(
            core.scheduler
                .schedule_repeating(core.config.keep_alive_interval(), TimerKind::KeepAlive),
        );
        self.ensure_reaper(core);
    }

    // ── Join ────────────────────────────────────────────────────────────

    pub(crate) fn join_room(&mut self, core: &mut Core, input: &str) {
        let canonical = canonical_room_id(input);
        if canonical.len() < core.config.min_room_id_length.max(1) {
            log::warn!("Rejecting room id {input:?} (canonical {canonical:?})");
            core.emit(SessionEvent::Error(ChatError::InvalidRoomId(
                input.trim().to_string(),
            )));
            return;
        }
        let target = PeerId::new(canonical);

        if !core.session.is_started() {
            log::info!("Session not started, join of {target} pending");
            self.pending_join = Some(target);
            return;
        }
        if self.join.as_ref().is_some_and(|j| j.target == target) {
            log::info!("Already joining {target}");
            return;
        }
        let live = |r: &&Room| {
            r.is_host() || (!self.orphaned.contains(&r.id) && core.connections.is_connected(&r.id))
        };
        if let Some(users) = self.rooms.get(&target).filter(live).map(|r| r.users.clone()) {
            self.abandon_join(core);
            log::info!("Already in room {target}, switching to it");
            self.current = Some(target.clone());
            core.emit(SessionEvent::Joined {
                room_id: target,
                users,
            });
            return;
        }
        if core.session.local_id() == Some(&target) {
            log::warn!("Refusing to join our own identity {target}");
            core.emit(SessionEvent::Error(ChatError::InvalidRoomId(
                target.to_string(),
            )));
            return;
        }
        self.abandon_join(core);
        let Some(me) = core.session.local_user() else {
            return;
        };

        log::info!("Joining room {target}");
        self.rooms
            .entry(target.clone())
            .or_insert_with(|| Room::placeholder(target.clone(), me));
        self.current = Some(target.clone());
        self.join = Some(JoinAttempt {
            target,
            retry: core.retry.start(),
            started_at: core.now(),
            timeout: None,
            retry_timer: None,
            introduced: false,
        });
        self.start_attempt(core);
    }

    pub(crate) fn on_session_started(&mut self, core: &mut Core) {
        if self.pending_join.is_some() {
            if let Some(old) = self.resume_timer.take() {
                core.scheduler.cancel(old);
            }
            self.resume_timer = Some(
                core.scheduler
                    .schedule(core.config.resume_join_delay(), TimerKind::ResumePendingJoin),
            );
        }
    }

    fn start_attempt(&mut self, core: &mut Core) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        let target = join.target.clone();
        let attempt = join.retry.attempt();
        join.started_at = core.now();
        join.introduced = false;
        join.retry_timer = None;
        if let Some(old) = join.timeout.take() {
            core.scheduler.cancel(old);
        }
        join.timeout = Some(
            core.scheduler
                .schedule(core.config.connect_timeout(), TimerKind::JoinTimeout { attempt }),
        );
        log::info!(
            "Connecting to room {target} (attempt {}/{})",
            attempt + 1,
            join.retry.max_attempts()
        );

        // The host is already linked to us through another room.
        if core.connections.is_connected(&target) {
            self.on_link_opened(core, &target);
            return;
        }
        core.connections.close_link(&target);
        match core.session.connect(&target) {
            Ok(link) => {
                core.connections.add_link(link);
                core.connections.set_retry_count(&target, attempt);
            }
            Err(e) => self.on_attempt_failed(core, e),
        }
    }

    /// The current attempt failed with an error (not a timeout).
    fn on_attempt_failed(&mut self, core: &mut Core, error: ChatError) {
        if !error.is_recoverable() {
            log::warn!("Join failed with {error}, not retrying");
            self.fail_join(core, error);
            return;
        }
        let Some(target) = self.join.as_ref().map(|j| j.target.clone()) else {
            return;
        };
        if !self.shared_with_rooms(&target) {
            core.connections.close_link(&target);
        }
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if let Some(t) = join.timeout.take() {
            core.scheduler.cancel(t);
        }

        let budget = core
            .config
            .connect_timeout()
            .saturating_sub(core.clock.since(join.started_at));
        match join.retry.on_error(budget) {
            RetryDecision::RetryAfter(delay) => {
                let attempt = join.retry.attempt();
                log::warn!("Join of {target} failed ({error}), retrying in {delay:?}");
                join.retry_timer = Some(
                    core.scheduler
                        .schedule(delay, TimerKind::JoinRetry { attempt }),
                );
            }
            RetryDecision::RetryNow => self.start_attempt(core),
            RetryDecision::GiveUp => self.fail_join(core, error),
        }
    }

    fn on_join_timeout(&mut self, core: &mut Core, id: TimerId) {
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if join.timeout != Some(id) {
            return;
        }
        join.timeout = None;
        let error = ChatError::LinkTimeout(join.target.clone());
        match join.retry.on_timeout() {
            RetryDecision::GiveUp => self.fail_join(core, error),
            _ => {
                log::warn!("Join of {} timed out, retrying", join.target);
                self.start_attempt(core);
            }
        }
    }

    fn on_join_retry(&mut self, core: &mut Core, id: TimerId) {
        if self.join.as_ref().and_then(|j| j.retry_timer) == Some(id) {
            self.start_attempt(core);
        }
    }

    /// Stop the join in flight: disarm its timers, say goodbye if we got as
    /// far as introducing ourselves, and drop its placeholder room.
    fn drop_join(&mut self, core: &mut Core) -> Option<JoinAttempt> {
        let join = self.join.take()?;
        for timer in [join.timeout, join.retry_timer].into_iter().flatten() {
            core.scheduler.cancel(timer);
        }
        if join.introduced {
            if let Some(me) = core.session.local_id().cloned() {
                let goodbye = Envelope::UserLeft(UserLeft {
                    id: me,
                    room_id: Some(join.target.clone()),
                });
                core.connections.send(&join.target, &goodbye);
            }
        }
        if !self.shared_with_rooms(&join.target) {
            core.connections.close_link(&join.target);
        }
        if self.rooms.get(&join.target).is_some_and(|r| !r.synced) {
            self.rooms.remove(&join.target);
            if self.current.as_ref() == Some(&join.target) {
                self.current = None;
            }
        }
        Some(join)
    }

    /// Another command took over from the join in flight.
    fn abandon_join(&mut self, core: &mut Core) {
        let Some(target) = self.join.as_ref().map(|j| j.target.clone()) else {
            return;
        };
        let placeholder = self.rooms.get(&target).is_some_and(|r| !r.synced);
        self.drop_join(core);
        log::info!("Abandoned join of {target}");
        if placeholder {
            core.emit(SessionEvent::Left { room_id: target });
        }
    }

    /// Retries are exhausted: surface one error and drop the placeholder.
    fn fail_join(&mut self, core: &mut Core, error: ChatError) {
        let Some(join) = self.drop_join(core) else {
            return;
        };
        log::error!("Could not join room {}: {error}", join.target);
        core.emit(SessionEvent::Error(error));
    }

    // ── Link lifecycle ──────────────────────────────────────────────────

    pub(crate) fn on_link_opened(&mut self, core: &mut Core, peer: &PeerId) {
        let Some(join) = self.join.as_mut().filter(|j| &j.target == peer) else {
            return;
        };
        if join.introduced {
            return;
        }
        let Some(me) = core.session.local_user() else {
            return;
        };
        if core.connections.send(peer, &Envelope::NewUser(me)) {
            join.introduced = true;
            log::info!("Introduced ourselves to {peer}, awaiting room state");
        }
    }

    pub(crate) fn on_link_closed(&mut self, core: &mut Core, peer: &PeerId) {
        let error = ChatError::from_link(peer, &LinkError::Closed);
        self.on_link_down(core, peer, error);
    }

    pub(crate) fn on_link_error(&mut self, core: &mut Core, peer: &PeerId, error: LinkError) {
        core.connections.close_link(peer);
        self.on_link_down(core, peer, ChatError::from_link(peer, &error));
    }

    /// The link to `peer` is gone, by close, error or reaping. Every room
    /// that used it finds out, and a join over it counts as failed.
    fn on_link_down(&mut self, core: &mut Core, peer: &PeerId, error: ChatError) {
        self.member_departed(core, peer);
        self.host_lost(core, peer);
        if self.join.as_ref().is_some_and(|j| &j.target == peer) {
            self.on_attempt_failed(core, error);
        }
    }

    /// Member side: the host of `room_id` is gone. The room stays readable.
    fn host_lost(&mut self, core: &mut Core, room_id: &PeerId) {
        let Some(room) = self
            .rooms
            .get_mut(room_id)
            .filter(|r| !r.is_host() && r.synced)
        else {
            return;
        };
        if !self.orphaned.insert(room_id.clone()) {
            return;
        }
        log::warn!("Lost link to host {room_id}");
        append_system(room, core, "The host has disconnected");
        core.emit(SessionEvent::HostDisconnected {
            room_id: room_id.clone(),
        });
    }

    /// Host side: `peer` is gone from our room, by announcement or link loss.
    fn member_departed(&mut self, core: &mut Core, peer: &PeerId) {
        let Some(room) = self.hosted_mut(core) else {
            return;
        };
        let Some(user) = room.remove_user(peer) else {
            return;
        };
        log::info!("{} ({peer}) left room {}", user.display_name, room.id);
        let left = Envelope::UserLeft(UserLeft {
            id: peer.clone(),
            room_id: Some(room.id.clone()),
        });
        send_to_members(room, core, &left, Some(peer));
        append_system(room, core, format!("{} left the room", user.display_name));
        core.emit(SessionEvent::UserLeft(user));
        self.release_link(core, peer);
    }

    // ── Membership envelopes ────────────────────────────────────────────

    pub(crate) fn on_new_user(&mut self, core: &mut Core, origin: &PeerId, user: User) {
        let Some(room) = self.hosted_mut(core) else {
            log::warn!("NEW_USER from {origin} but we host no room");
            return;
        };
        if &user.id != origin {
            log::warn!("NEW_USER for {} arrived on link from {origin}, dropping", user.id);
            return;
        }

        let added = room.add_user(user.clone());
        if added {
            send_to_members(room, core, &Envelope::UserJoined(user.clone()), Some(origin));
        } else {
            log::info!("{origin} re-introduced itself");
        }

        let snapshot = RoomSnapshot {
            users: room.users.clone(),
            history: room.history.clone(),
        };
        if !core.connections.send(origin, &Envelope::RoomState(snapshot)) {
            log::warn!("Could not send room state to {origin}");
        }

        if added {
            log::info!("{} ({origin}) joined room {}", user.display_name, room.id);
            append_system(room, core, format!("{} joined the room", user.display_name));
            core.emit(SessionEvent::UserJoined(user));
        }
    }

    pub(crate) fn on_user_joined(&mut self, core: &mut Core, origin: &PeerId, user: User) {
        let Some(room) = self.rooms.get_mut(origin).filter(|r| !r.is_host()) else {
            log::warn!("USER_JOINED from {origin}, who is not our host");
            return;
        };
        if room.add_user(user.clone()) {
            append_system(room, core, format!("{} joined the room", user.display_name));
            core.emit(SessionEvent::UserJoined(user));
        }
    }

    pub(crate) fn on_room_state(&mut self, core: &mut Core, origin: &PeerId, snapshot: RoomSnapshot) {
        if !self.join.as_ref().is_some_and(|j| &j.target == origin) {
            log::warn!("Unsolicited ROOM_STATE from {origin}, dropping");
            return;
        }
        let Some(join) = self.join.take() else {
            return;
        };
        for timer in [join.timeout, join.retry_timer].into_iter().flatten() {
            core.scheduler.cancel(timer);
        }
        let Some(me) = core.session.local_user() else {
            return;
        };

        self.orphaned.remove(origin);
        let room = self
            .rooms
            .entry(origin.clone())
            .or_insert_with(|| Room::placeholder(origin.clone(), me));
        room.users = snapshot.users;
        room.history = snapshot.history;
        room.last_message = room
            .history
            .iter()
            .rev()
            .find(|m| !m.is_system())
            .map(|m| LastMessage {
                content: m.content.clone(),
                timestamp: m.timestamp,
            });
        if let Some(host) = room.user(origin) {
            room.name = format!("{}'s room", host.display_name);
        }
        room.synced = true;

        log::info!(
            "Joined room {} ({} users, {} messages)",
            room.id,
            room.users.len(),
            room.history.len()
        );
        core.emit(SessionEvent::Joined {
            room_id: room.id.clone(),
            users: room.users.clone(),
        });
        self.current = Some(origin.clone());
        self.ensure_reaper(core);
    }

    /// `USER_LEFT` may concern the room we host (a member said goodbye) or
    /// the room `origin` hosts for us (someone left there, or the host
    /// itself). Without a room id it applies to both.
    pub(crate) fn on_user_left(&mut self, core: &mut Core, origin: &PeerId, left: UserLeft) {
        let Some(me) = core.session.local_id().cloned() else {
            return;
        };
        let names = |room: &PeerId| left.room_id.as_ref().map_or(true, |id| id == room);
        let mut matched = false;

        if names(&me) && self.rooms.get(&me).is_some_and(|r| r.is_host() && r.contains(origin)) {
            matched = true;
            if &left.id == origin {
                self.member_departed(core, origin);
            } else {
                log::warn!("USER_LEFT for {} arrived on link from {origin}, dropping", left.id);
            }
        }

        if names(origin) && self.rooms.get(origin).is_some_and(|r| !r.is_host()) {
            matched = true;
            if &left.id == origin {
                self.host_lost(core, origin);
                self.release_link(core, origin);
            } else if let Some(room) = self.rooms.get_mut(origin) {
                if let Some(user) = room.remove_user(&left.id) {
                    append_system(room, core, format!("{} left the room", user.display_name));
                    core.emit(SessionEvent::UserLeft(user));
                }
            }
        }

        if !matched {
            log::warn!("USER_LEFT from {origin} matches none of our rooms");
        }
    }

    pub(crate) fn on_keep_alive(&mut self, core: &mut Core, origin: &PeerId) {
        let ack = Envelope::KeepAliveAck(KeepAlive {
            timestamp: core.now(),
        });
        core.connections.send(origin, &ack);
    }

    // ── Timers ──────────────────────────────────────────────────────────

    pub(crate) fn on_timer(&mut self, core: &mut Core, event: TimerEvent) {
        match event.kind {
            TimerKind::JoinTimeout { .. } => self.on_join_timeout(core, event.id),
            TimerKind::JoinRetry { .. } => self.on_join_retry(core, event.id),
            TimerKind::KeepAlive => {
                if self.keep_alive != Some(event.id) {
                    return;
                }
                let ping = Envelope::KeepAlive(KeepAlive {
                    timestamp: core.now(),
                });
                let sent = core.connections.broadcast(&ping, &[]);
                log::debug!("Keep-alive sent to {sent} peers");
            }
            TimerKind::ReapIdle => {
                if self.reaper != Some(event.id) {
                    return;
                }
                for peer in core.connections.reap_idle(core.config.idle_timeout()) {
                    let error = ChatError::LinkTimeout(peer.clone());
                    self.on_link_down(core, &peer, error);
                }
            }
            TimerKind::ResumePendingJoin => {
                if self.resume_timer != Some(event.id) {
                    return;
                }
                self.resume_timer = None;
                if let Some(target) = self.pending_join.take() {
                    log::info!("Resuming pending join of {target}");
                    self.join_room(core, target.as_str());
                }
            }
        }
    }

    fn ensure_reaper(&mut self, core: &mut Core) {
        if self.reaper.is_none() {
            self.reaper = Some(
                core.scheduler
                    .schedule_repeating(core.config.reap_interval(), TimerKind::ReapIdle),
            );
        }
    }

    // ── Leave ───────────────────────────────────────────────────────────

    /// Leave the current room. Other rooms are untouched.
    pub(crate) fn leave_room(&mut self, core: &mut Core) {
        let Some(room_id) = self.current.clone() else {
            if self.pending_join.take().is_some() {
                log::info!("Pending join cancelled");
                if let Some(t) = self.resume_timer.take() {
                    core.scheduler.cancel(t);
                }
                return;
            }
            core.emit(SessionEvent::Error(ChatError::NoActiveRoom));
            return;
        };
        self.leave(core, &room_id);
    }

    /// Leave every room and any join in flight.
    pub(crate) fn leave_all(&mut self, core: &mut Core) {
        let mut ids: Vec<PeerId> = self.rooms.keys().cloned().collect();
        if let Some(join) = &self.join {
            if !ids.contains(&join.target) {
                ids.push(join.target.clone());
            }
        }
        // Current room first, so its `Left` comes first.
        if let Some(current) = &self.current {
            if let Some(pos) = ids.iter().position(|id| id == current) {
                ids.swap(0, pos);
            }
        }
        for id in ids {
            self.leave(core, &id);
        }
    }

    /// Tell everyone who shares `room_id` that we are gone, close the links
    /// no other room needs and forget the room.
    fn leave(&mut self, core: &mut Core, room_id: &PeerId) {
        let joining = self.join.as_ref().is_some_and(|j| &j.target == room_id);
        if joining {
            if let Some(join) = self.join.take() {
                for timer in [join.timeout, join.retry_timer].into_iter().flatten() {
                    core.scheduler.cancel(timer);
                }
            }
        }
        let room = self.rooms.remove(room_id);
        if room.is_none() && !joining {
            return;
        }
        self.orphaned.remove(room_id);
        if self.current.as_ref() == Some(room_id) {
            self.current = None;
        }

        let hosted = room.as_ref().is_some_and(Room::is_host);
        let peers: Vec<PeerId> = match &room {
            Some(r) if r.is_host() => r
                .users
                .iter()
                .filter(|u| u.id != r.id)
                .map(|u| u.id.clone())
                .collect(),
            _ => vec![room_id.clone()],
        };
        if let Some(me) = core.session.local_id().cloned() {
            let goodbye = Envelope::UserLeft(UserLeft {
                id: me,
                room_id: Some(room_id.clone()),
            });
            let sent = peers
                .iter()
                .filter(|peer| core.connections.send(peer, &goodbye))
                .count();
            log::debug!("USER_LEFT sent to {sent} peers");
        }
        for peer in &peers {
            self.release_link(core, peer);
        }

        if hosted {
            if let Some(t) = self.keep_alive.take() {
                core.scheduler.cancel(t);
            }
        }
        if self.rooms.is_empty() && self.join.is_none() {
            if let Some(t) = self.reaper.take() {
                core.scheduler.cancel(t);
            }
        }

        log::info!("Left room {room_id}");
        core.emit(SessionEvent::Left {
            room_id: room_id.clone(),
        });
    }

    /// Disarm every timer this service owns.
    pub(crate) fn cancel_all(&mut self, core: &mut Core) {
        let join_timers = self
            .join
            .as_mut()
            .map(|j| [j.timeout.take(), j.retry_timer.take()])
            .unwrap_or_default();
        let own = [
            self.keep_alive.take(),
            self.reaper.take(),
            self.resume_timer.take(),
        ];
        for timer in join_timers.into_iter().chain(own).flatten() {
            core.scheduler.cancel(timer);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
