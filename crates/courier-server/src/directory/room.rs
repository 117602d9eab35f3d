//! Room model: permissions, members and the persisted room record.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use courier_proto::{
    RoomKind,
    payloads::{
        presence::VoiceState,
        queue::Delivery,
        room::{MemberInfo, RoomInfo},
    },
};
use serde::{Deserialize, Serialize};

/// Grants every user.
pub const EVERYONE: &str = "*";

/// A grantable capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Join and receive
    Read,
    /// Send messages
    Write,
    /// Invite others
    Invite,
    /// Change permissions and roles
    Manage,
    /// Kick, mute and ban
    Moderate,
    /// Delete the room
    Delete,
}

impl Permission {
    /// Every permission.
    pub const ALL: [Self; 6] =
        [Self::Read, Self::Write, Self::Invite, Self::Manage, Self::Moderate, Self::Delete];
}

/// Permission sets. Each holds user ids, role ids or [`EVERYONE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// May join and receive
    pub can_read: BTreeSet<String>,
    /// May send
    pub can_write: BTreeSet<String>,
    /// May invite
    pub can_invite: BTreeSet<String>,
    /// May manage permissions
    pub can_manage: BTreeSet<String>,
    /// May moderate
    pub can_moderate: BTreeSet<String>,
    /// May delete
    pub can_delete: BTreeSet<String>,
    /// Users who may never be members
    pub blacklisted: BTreeSet<String>,
}

impl Permissions {
    fn set(&self, permission: Permission) -> &BTreeSet<String> {
        match permission {
            Permission::Read => &self.can_read,
            Permission::Write => &self.can_write,
            Permission::Invite => &self.can_invite,
            Permission::Manage => &self.can_manage,
            Permission::Moderate => &self.can_moderate,
            Permission::Delete => &self.can_delete,
        }
    }

    pub(crate) fn set_mut(&mut self, permission: Permission) -> &mut BTreeSet<String> {
        match permission {
            Permission::Read => &mut self.can_read,
            Permission::Write => &mut self.can_write,
            Permission::Invite => &mut self.can_invite,
            Permission::Manage => &mut self.can_manage,
            Permission::Moderate => &mut self.can_moderate,
            Permission::Delete => &mut self.can_delete,
        }
    }

    /// Whether `user` (holding `roles`) has `permission`. Blacklisted users
    /// have nothing.
    pub fn allows(&self, permission: Permission, user: &str, roles: &BTreeSet<String>) -> bool {
        if self.blacklisted.contains(user) {
            return false;
        }
        let set = self.set(permission);
        set.contains(EVERYONE) || set.contains(user) || roles.iter().any(|r| set.contains(r))
    }

    /// Effective permission list for `user`.
    pub fn effective(&self, user: &str, roles: &BTreeSet<String>) -> Vec<Permission> {
        Permission::ALL.into_iter().filter(|p| self.allows(*p, user, roles)).collect()
    }
}

/// A user's local membership of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    /// Member
    pub user_id: String,
    /// Local sockets joined to the room
    pub sockets: BTreeSet<u64>,
    /// Voice state, voice and video rooms only
    pub voice: Option<VoiceState>,
}

/// Room metadata shared through the broker under `room:<id>`.
///
/// Local membership, history and remote membership are not part of the
/// record: they are per-instance caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Room id
    pub id: String,
    /// Kind
    pub kind: RoomKind,
    /// Join requires read permission
    pub private: bool,
    /// Owner; holds every permission and cannot be moderated
    pub owner_id: String,
    /// Enclosing room
    pub parent_id: Option<String>,
    /// Join password
    pub password: Option<String>,
    /// Permission sets
    pub permissions: Permissions,
    /// Role assignments per user
    pub roles: BTreeMap<String, BTreeSet<String>>,
    /// Muted users
    pub muted: BTreeSet<String>,
    /// Creation time (Unix millis)
    pub created_at_ms: u64,
    /// Last join, leave or message (Unix millis)
    pub last_activity_ms: u64,
}

impl RoomRecord {
    /// Broker key for a room id.
    pub fn key(room_id: &str) -> String {
        format!("room:{room_id}")
    }

    /// Serialize for the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| e.to_string())?;
        Ok(buf)
    }

    /// Deserialize a broker record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        ciborium::from_reader(bytes).map_err(|e| e.to_string())
    }
}

/// A room as seen by this instance.
#[derive(Debug, Clone)]
pub struct Room {
    /// Shared metadata
    pub record: RoomRecord,
    /// Members with sockets on this instance
    pub members: BTreeMap<String, RoomMember>,
    /// Members known to be joined on other instances
    pub remote_members: BTreeSet<String>,
    /// Recent chat messages, oldest first
    pub history: VecDeque<Delivery>,
}

impl Room {
    /// Wrap a record with empty local state.
    pub fn from_record(record: RoomRecord) -> Self {
        Self {
            record,
            members: BTreeMap::new(),
            remote_members: BTreeSet::new(),
            history: VecDeque::new(),
        }
    }

    /// Room id.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Roles held by `user` in this room.
    pub fn roles_of(&self, user: &str) -> BTreeSet<String> {
        self.record.roles.get(user).cloned().unwrap_or_default()
    }

    /// Whether `user` has `permission`. The owner has everything unless
    /// blacklisted.
    pub fn allows(&self, permission: Permission, user: &str) -> bool {
        if self.record.permissions.blacklisted.contains(user) {
            return false;
        }
        user == self.record.owner_id
            || self.record.permissions.allows(permission, user, &self.roles_of(user))
    }

    /// Whether `user` is blacklisted.
    pub fn is_blacklisted(&self, user: &str) -> bool {
        self.record.permissions.blacklisted.contains(user)
    }

    /// Whether nobody is joined here or elsewhere.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.remote_members.is_empty()
    }

    /// Every local socket joined to the room.
    pub fn sockets(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.values().flat_map(|m| m.sockets.iter().copied())
    }

    /// Local and remote member ids.
    pub fn member_ids(&self) -> BTreeSet<String> {
        self.members.keys().chain(self.remote_members.iter()).cloned().collect()
    }

    /// Remove `user` locally. Returns their sockets.
    pub fn remove_member(&mut self, user: &str) -> Vec<u64> {
        self.remote_members.remove(user);
        self.members.remove(user).map(|m| m.sockets.into_iter().collect()).unwrap_or_default()
    }

    /// Client-facing summary.
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.record.id.clone(),
            kind: self.record.kind,
            private: self.record.private,
            owner_id: self.record.owner_id.clone(),
            parent_id: self.record.parent_id.clone(),
        }
    }

    /// Local and remote members.
    pub fn member_infos(&self) -> Vec<MemberInfo> {
        let mut infos: Vec<MemberInfo> = self
            .members
            .values()
            .map(|m| MemberInfo {
                user_id: m.user_id.clone(),
                roles: self.roles_of(&m.user_id).into_iter().collect(),
                muted: self.record.muted.contains(&m.user_id),
                voice: m.voice.clone(),
            })
            .collect();

        for user in self.remote_members.iter().filter(|u| !self.members.contains_key(*u)) {
            infos.push(MemberInfo {
                user_id: user.clone(),
                roles: self.roles_of(user).into_iter().collect(),
                muted: self.record.muted.contains(user),
                voice: None,
            });
        }
        infos
    }

    /// Append to the bounded history.
    pub fn record_history(&mut self, delivery: Delivery, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissions() -> Permissions {
        let mut p = Permissions::default();
        p.can_read.insert("moderators".into());
        p.can_write.insert(EVERYONE.into());
        p.can_moderate.insert("bob".into());
        p
    }

    #[test]
    fn allows_by_user_role_or_everyone() {
        let p = permissions();
        let none = BTreeSet::new();
        let mods: BTreeSet<String> = ["moderators".to_string()].into();

        assert!(p.allows(Permission::Write, "anyone", &none));
        assert!(!p.allows(Permission::Read, "anyone", &none));
        assert!(p.allows(Permission::Read, "anyone", &mods));
        assert!(p.allows(Permission::Moderate, "bob", &none));
    }

    #[test]
    fn blacklist_overrides_everything() {
        let mut p = permissions();
        p.blacklisted.insert("bob".into());
        assert!(!p.allows(Permission::Write, "bob", &BTreeSet::new()));
        assert!(p.effective("bob", &BTreeSet::new()).is_empty());
    }

    #[test]
    fn record_round_trip() {
        let record = RoomRecord {
            id: "general".into(),
            kind: RoomKind::Community,
            private: false,
            owner_id: "alice".into(),
            parent_id: None,
            password: None,
            permissions: permissions(),
            roles: BTreeMap::new(),
            muted: BTreeSet::new(),
            created_at_ms: 1,
            last_activity_ms: 2,
        };
        let decoded = RoomRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
