//! Room & presence directory.
//!
//! Answers "who should receive this" for the delivery queue and gates room
//! operations on permissions. Room metadata is shared through the broker
//! (`room:<id>`); local membership is per-instance and mirrored to peers
//! through the fabric as member updates. Applying an update that is already
//! reflected locally is a no-op, so redelivery and races settle without locks.
//!
//! Timers (typing expiry, timed mutes) live in [`TimerWheel`]s and fire from
//! [`Directory::tick`].

mod presence;
mod room;

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use courier_core::{Instant, TimerWheel};
use courier_proto::{
    ErrorPayload, ModerationKind, PresenceStatus,
    payloads::{
        moderation::{ModerationAction, ModerationRequest},
        presence::VoiceState,
        queue::Delivery,
        room::{MemberUpdate, RoomCreate, RoomError},
    },
};
pub use presence::{PresenceBook, visible};
pub use room::{EVERYONE, Permission, Permissions, Room, RoomMember, RoomRecord};
use thiserror::Error;

use crate::config::DirectoryConfig;

/// Directory errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Room does not exist
    #[error("room {0} not found")]
    NotFound(String),

    /// Caller lacks permission or is blacklisted
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Room id already taken
    #[error("room {0} already exists")]
    AlreadyExists(String),
}

impl DirectoryError {
    /// Client-facing form.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::NotFound(_) => ErrorPayload::new(ErrorPayload::ROOM_NOT_FOUND, self.to_string()),
            Self::Forbidden(_) => ErrorPayload::forbidden(self.to_string()),
            Self::AlreadyExists(_) => ErrorPayload::invalid_message(self.to_string()),
        }
    }

    /// `room:error` for a failed `action`.
    pub fn to_room_error(&self, action: &str) -> RoomError {
        let payload = self.to_payload();
        RoomError { action: action.to_string(), reason: payload.message, code: payload.code }
    }
}

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    /// The user had no local socket in the room before
    pub newly_joined: bool,
}

/// Result of a moderation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moderated {
    /// Broadcast payload
    pub action: ModerationAction,
    /// Local sockets removed, as `(room, socket)`
    pub evicted: Vec<(String, u64)>,
}

/// Timer-driven directory events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Typing indicator timed out
    TypingExpired {
        /// Room
        room_id: String,
        /// User
        user_id: String,
    },
    /// Timed mute ended
    MuteExpired {
        /// Room
        room_id: String,
        /// User
        user_id: String,
    },
    /// Presence demoted to offline by the inactivity sweep
    PresenceOffline {
        /// User
        user_id: String,
    },
}

/// Rooms, memberships, permissions and ephemeral state for one instance.
#[derive(Debug, Clone)]
pub struct Directory<I: Instant> {
    config: DirectoryConfig,
    rooms: HashMap<String, Room>,
    presence: PresenceBook<I>,
    mutes: TimerWheel<I, (String, String)>,
}

impl<I: Instant> Directory<I> {
    /// Empty directory.
    pub fn new(config: DirectoryConfig) -> Self {
        let presence = PresenceBook::new(
            Duration::from_millis(config.presence_timeout_ms),
            Duration::from_millis(config.typing_timeout_ms),
        );
        Self { config, rooms: HashMap::new(), presence, mutes: TimerWheel::new() }
    }

    /// Create a room owned by `owner`. Public rooms are readable and writable
    /// by everyone.
    pub fn create_room(
        &mut self,
        owner: &str,
        request: RoomCreate,
        now_ms: u64,
    ) -> Result<&Room, DirectoryError> {
        if request.room_id.is_empty() {
            return Err(DirectoryError::NotFound(String::new()));
        }
        if self.rooms.contains_key(&request.room_id) {
            return Err(DirectoryError::AlreadyExists(request.room_id));
        }

        let mut permissions = Permissions::default();
        for permission in Permission::ALL {
            permissions.set_mut(permission).insert(owner.to_string());
        }
        if !request.private {
            permissions.can_read.insert(EVERYONE.to_string());
            permissions.can_write.insert(EVERYONE.to_string());
        }

        let record = RoomRecord {
            id: request.room_id.clone(),
            kind: request.kind,
            private: request.private,
            owner_id: owner.to_string(),
            parent_id: request.parent_id,
            password: request.password,
            permissions,
            roles: Default::default(),
            muted: BTreeSet::new(),
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
        };
        tracing::debug!(room_id = %record.id, owner, "room created");

        let room = self.rooms.entry(request.room_id).or_insert(Room::from_record(record));
        Ok(room)
    }

    /// Adopt shared metadata from the broker. Local membership and history
    /// are kept; the record replaces cached metadata (last write wins).
    pub fn sync_record(&mut self, record: RoomRecord) {
        match self.rooms.get_mut(&record.id) {
            Some(room) => {
                let last_activity_ms = room.record.last_activity_ms.max(record.last_activity_ms);
                room.record = record;
                room.record.last_activity_ms = last_activity_ms;
            },
            None => {
                self.rooms.insert(record.id.clone(), Room::from_record(record));
            },
        }
    }

    /// Room by id.
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Shared metadata of a room, for persisting.
    pub fn record(&self, room_id: &str) -> Option<RoomRecord> {
        self.rooms.get(room_id).map(|r| r.record.clone())
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut Room, DirectoryError> {
        self.rooms.get_mut(room_id).ok_or_else(|| DirectoryError::NotFound(room_id.to_string()))
    }

    /// Join `socket` of `user` to a room.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the room is unknown
    /// - `Forbidden` if the user is blacklisted, lacks read permission on a
    ///   private room, or gives the wrong password
    pub fn join(
        &mut self,
        room_id: &str,
        user: &str,
        socket: u64,
        password: Option<&str>,
        now_ms: u64,
    ) -> Result<Joined, DirectoryError> {
        let room = self.room_mut(room_id)?;
        if let Some(expected) = &room.record.password
            && user != room.record.owner_id
            && !room.is_blacklisted(user)
            && password != Some(expected.as_str())
        {
            return Err(DirectoryError::Forbidden("wrong room password".to_string()));
        }
        self.rejoin(room_id, user, socket, now_ms)
    }

    /// Join without a password check, for a restored session re-entering a
    /// room it already held. Bans and read permission still apply.
    pub fn rejoin(
        &mut self,
        room_id: &str,
        user: &str,
        socket: u64,
        now_ms: u64,
    ) -> Result<Joined, DirectoryError> {
        let room = self.room_mut(room_id)?;
        if room.is_blacklisted(user) {
            return Err(DirectoryError::Forbidden(format!("{user} is banned from {room_id}")));
        }
        if room.record.private && !room.allows(Permission::Read, user) {
            return Err(DirectoryError::Forbidden(format!("{room_id} is private")));
        }

        let member = room.members.entry(user.to_string()).or_insert_with(|| RoomMember {
            user_id: user.to_string(),
            sockets: BTreeSet::new(),
            voice: None,
        });
        let newly_joined = member.sockets.is_empty();
        member.sockets.insert(socket);
        room.remote_members.remove(user);
        room.record.last_activity_ms = room.record.last_activity_ms.max(now_ms);
        Ok(Joined { newly_joined })
    }

    /// Remove one socket from a room. Returns true if the user has no local
    /// socket left in it.
    pub fn leave(
        &mut self,
        room_id: &str,
        user: &str,
        socket: u64,
        now_ms: u64,
    ) -> Result<bool, DirectoryError> {
        let room = self.room_mut(room_id)?;
        room.record.last_activity_ms = room.record.last_activity_ms.max(now_ms);
        let Some(member) = room.members.get_mut(user) else {
            return Ok(false);
        };
        member.sockets.remove(&socket);
        if !member.sockets.is_empty() {
            return Ok(false);
        }
        room.members.remove(user);
        self.presence.stop_all_typing(user, Some(room_id));
        Ok(true)
    }

    /// Drop `socket` from every room at once, voice state included. Returns
    /// the rooms `user` no longer has any local socket in.
    pub fn release_socket(&mut self, user: &str, socket: u64, now_ms: u64) -> Vec<String> {
        let mut left = Vec::new();
        for room in self.rooms.values_mut() {
            let Some(member) = room.members.get_mut(user) else {
                continue;
            };
            if !member.sockets.remove(&socket) {
                continue;
            }
            if member.sockets.is_empty() {
                room.members.remove(user);
                room.record.last_activity_ms = room.record.last_activity_ms.max(now_ms);
                left.push(room.record.id.clone());
            }
        }
        for room_id in &left {
            self.presence.stop_all_typing(user, Some(room_id));
        }
        left.sort();
        left
    }

    /// Whether `user` may send to a room right now.
    pub fn can_send(&self, room_id: &str, user: &str) -> Result<(), DirectoryError> {
        let room =
            self.rooms.get(room_id).ok_or_else(|| DirectoryError::NotFound(room_id.to_string()))?;
        if !room.allows(Permission::Write, user) {
            return Err(DirectoryError::Forbidden(format!("no write permission in {room_id}")));
        }
        if room.record.muted.contains(user) {
            return Err(DirectoryError::Forbidden(format!("{user} is muted in {room_id}")));
        }
        Ok(())
    }

    /// Apply a moderation request from `actor`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the room is unknown
    /// - `Forbidden` unless `actor` owns the room or may moderate it, or if
    ///   the target is the owner
    pub fn moderate(
        &mut self,
        actor: &str,
        kind: ModerationKind,
        request: ModerationRequest,
        now: I,
    ) -> Result<Moderated, DirectoryError> {
        let room = self.room_mut(&request.room_id)?;
        if !room.allows(Permission::Moderate, actor) {
            return Err(DirectoryError::Forbidden(format!(
                "{actor} may not moderate {}",
                request.room_id
            )));
        }
        if request.target_user_id == room.record.owner_id {
            return Err(DirectoryError::Forbidden("the owner cannot be moderated".to_string()));
        }

        let action = ModerationAction {
            kind,
            room_id: request.room_id,
            target_user_id: request.target_user_id,
            moderator_id: actor.to_string(),
            reason: request.reason,
            duration_ms: if kind == ModerationKind::Mute { request.duration_ms } else { None },
        };
        let evicted = self.apply_moderation(&action, now);
        tracing::info!(
            room_id = %action.room_id,
            target = %action.target_user_id,
            moderator = actor,
            kind = ?kind,
            evicted = evicted.len(),
            "moderation applied"
        );
        Ok(Moderated { action, evicted })
    }

    /// Apply an action already authorized elsewhere (a peer instance).
    /// Idempotent.
    pub fn apply_moderation(&mut self, action: &ModerationAction, now: I) -> Vec<(String, u64)> {
        let target = action.target_user_id.as_str();
        match action.kind {
            ModerationKind::Kick => self
                .rooms
                .get_mut(&action.room_id)
                .map(|room| {
                    room.remove_member(target)
                        .into_iter()
                        .map(|s| (action.room_id.clone(), s))
                        .collect()
                })
                .unwrap_or_default(),
            ModerationKind::Mute => {
                if let Some(room) = self.rooms.get_mut(&action.room_id) {
                    room.record.muted.insert(target.to_string());
                }
                let key = (action.room_id.clone(), target.to_string());
                match action.duration_ms {
                    Some(ms) => self.mutes.schedule(key, now + Duration::from_millis(ms)),
                    None => {
                        self.mutes.cancel(&key);
                    },
                }
                Vec::new()
            },
            ModerationKind::Ban => {
                if let Some(room) = self.rooms.get_mut(&action.room_id) {
                    room.record.permissions.blacklisted.insert(target.to_string());
                }
                self.evict_from_family(&action.room_id, target)
            },
            ModerationKind::Unmute => {
                if let Some(room) = self.rooms.get_mut(&action.room_id) {
                    room.record.muted.remove(target);
                }
                self.mutes.cancel(&(action.room_id.clone(), target.to_string()));
                Vec::new()
            },
            ModerationKind::Unban => {
                if let Some(room) = self.rooms.get_mut(&action.room_id) {
                    room.record.permissions.blacklisted.remove(target);
                }
                Vec::new()
            },
        }
    }

    /// Remove `user` from `room_id` and every room sharing its parent.
    fn evict_from_family(&mut self, room_id: &str, user: &str) -> Vec<(String, u64)> {
        let root = self
            .rooms
            .get(room_id)
            .and_then(|r| r.record.parent_id.clone())
            .unwrap_or_else(|| room_id.to_string());

        let mut evicted = Vec::new();
        for room in self.rooms.values_mut() {
            let in_family = room.record.id == root
                || room.record.id == room_id
                || room.record.parent_id.as_deref() == Some(root.as_str());
            if !in_family {
                continue;
            }
            let id = room.record.id.clone();
            evicted.extend(room.remove_member(user).into_iter().map(|s| (id.clone(), s)));
        }
        for (room, _) in &evicted {
            self.presence.stop_all_typing(user, Some(room));
        }
        evicted.sort();
        evicted
    }

    /// Update a member's voice state. The room must be a voice or video room
    /// and the user a local member.
    pub fn voice_state(
        &mut self,
        user: &str,
        mut state: VoiceState,
    ) -> Result<VoiceState, DirectoryError> {
        let room = self.room_mut(&state.room_id)?;
        if !room.record.kind.has_voice() {
            return Err(DirectoryError::Forbidden(format!("{} has no voice", state.room_id)));
        }
        let Some(member) = room.members.get_mut(user) else {
            return Err(DirectoryError::Forbidden(format!("{user} is not in {}", state.room_id)));
        };
        state.user_id = Some(user.to_string());
        member.voice = Some(state.clone());
        Ok(state)
    }

    /// Mirror a peer's membership change. Idempotent.
    pub fn apply_remote_member(&mut self, update: &MemberUpdate) {
        let Some(room) = self.rooms.get_mut(&update.room_id) else {
            return;
        };
        if update.joined {
            if !room.is_blacklisted(&update.user_id) {
                room.remote_members.insert(update.user_id.clone());
            }
        } else {
            room.remote_members.remove(&update.user_id);
        }
    }

    /// Local sockets of every member of a room.
    pub fn room_sockets(&self, room_id: &str) -> Vec<u64> {
        self.rooms.get(room_id).map(|r| r.sockets().collect()).unwrap_or_default()
    }

    /// Local sockets in `server_id` and every room under it.
    pub fn server_sockets(&self, server_id: &str) -> Vec<u64> {
        let mut sockets: BTreeSet<u64> = BTreeSet::new();
        for room in self.rooms.values() {
            if room.record.id == server_id || room.record.parent_id.as_deref() == Some(server_id) {
                sockets.extend(room.sockets());
            }
        }
        sockets.into_iter().collect()
    }

    /// Users joined to a room on any instance.
    pub fn room_members(&self, room_id: &str) -> BTreeSet<String> {
        self.rooms.get(room_id).map(Room::member_ids).unwrap_or_default()
    }

    /// Users joined to `server_id` or any room under it, on any instance.
    pub fn server_members(&self, server_id: &str) -> BTreeSet<String> {
        self.rooms
            .values()
            .filter(|r| r.record.id == server_id || r.record.parent_id.as_deref() == Some(server_id))
            .flat_map(Room::member_ids)
            .collect()
    }

    /// Local sockets sharing a room with `user`, wherever `user` is joined.
    pub fn audience_of(&self, user: &str) -> Vec<u64> {
        let mut sockets: BTreeSet<u64> = BTreeSet::new();
        for room in self.rooms.values() {
            if room.members.contains_key(user) || room.remote_members.contains(user) {
                sockets.extend(room.sockets());
            }
        }
        sockets.into_iter().collect()
    }

    /// Keep a chat message for `room:joined` history.
    pub fn record_history(&mut self, room_id: &str, delivery: Delivery, now_ms: u64) {
        let limit = self.config.recent_history;
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.record.last_activity_ms = room.record.last_activity_ms.max(now_ms);
            room.record_history(delivery, limit);
        }
    }

    /// Start or restart a typing indicator. Returns true when it was not
    /// already active.
    pub fn typing_start(&mut self, room_id: &str, user: &str, now: I) -> Result<bool, DirectoryError> {
        let room =
            self.rooms.get(room_id).ok_or_else(|| DirectoryError::NotFound(room_id.to_string()))?;
        if !room.members.contains_key(user) {
            return Err(DirectoryError::Forbidden(format!("{user} is not in {room_id}")));
        }
        Ok(self.presence.start_typing(user, room_id, now))
    }

    /// Stop a typing indicator. Returns true if it was active.
    pub fn typing_stop(&mut self, room_id: &str, user: &str) -> bool {
        self.presence.stop_typing(user, room_id)
    }

    /// Presence book.
    pub fn presence(&self) -> &PresenceBook<I> {
        &self.presence
    }

    /// Set presence. Returns the visible status if it changed.
    pub fn set_presence(
        &mut self,
        user: &str,
        status: PresenceStatus,
        now: I,
    ) -> Option<PresenceStatus> {
        self.presence.set(user, status, now)
    }

    /// Record activity for the presence sweep.
    pub fn touch_presence(&mut self, user: &str, now: I) -> Option<PresenceStatus> {
        self.presence.touch(user, now)
    }

    /// Mark a user offline (their last socket closed).
    pub fn clear_presence(&mut self, user: &str, now: I) -> Option<PresenceStatus> {
        self.presence.clear(user, now)
    }

    /// Fire due timers and run the presence sweep.
    pub fn tick(&mut self, now: I) -> Vec<DirectoryEvent> {
        let mut events = Vec::new();

        for (user_id, room_id) in self.presence.expired_typing(now) {
            events.push(DirectoryEvent::TypingExpired { room_id, user_id });
        }

        for (room_id, user_id) in self.mutes.poll_expired(now) {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.record.muted.remove(&user_id);
            }
            events.push(DirectoryEvent::MuteExpired { room_id, user_id });
        }

        for user_id in self.presence.sweep(now) {
            events.push(DirectoryEvent::PresenceOffline { user_id });
        }
        events
    }

    /// Remove rooms that are empty everywhere and idle past the threshold.
    pub fn sweep_rooms(&mut self, now_ms: u64) -> Vec<String> {
        let threshold = self.config.room_idle_threshold_ms;
        let mut removed: Vec<String> = self
            .rooms
            .values()
            .filter(|r| {
                r.is_empty() && now_ms.saturating_sub(r.record.last_activity_ms) > threshold
            })
            .map(|r| r.record.id.clone())
            .collect();
        for id in &removed {
            self.rooms.remove(id);
            self.mutes.cancel_where(|(room, _)| room == id);
        }
        removed.sort();
        removed
    }

    /// Known rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Local memberships across all rooms.
    pub fn membership_count(&self) -> usize {
        self.rooms.values().map(|r| r.members.len()).sum()
    }
}
