//! Connection registry for socket, user and session tracking.
//!
//! The registry maintains the reverse indexes the driver routes with:
//! user → sockets (user-targeted delivery), session → socket (duplicate
//! connection detection) and address → count (per-IP ceilings). Every index
//! is cleaned up when a socket is unregistered.
//!
//! A socket starts anonymous and is bound to an identity once its handshake
//! completes. A user may hold several sockets, one per session.

use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
};

/// Identity a socket claimed in its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User
    pub user_id: String,
    /// Device
    pub device_id: String,
    /// Session the socket is bound to
    pub session_id: String,
}

/// Information about a registered socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    /// Peer address
    pub addr: IpAddr,
    /// Set once the handshake completes
    pub identity: Option<Identity>,
}

impl SocketInfo {
    /// Anonymous socket from `addr`.
    pub fn new(addr: IpAddr) -> Self {
        Self { addr, identity: None }
    }

    /// User id, if handshaken.
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    /// Session id, if handshaken.
    pub fn session_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.session_id.as_str())
    }
}

/// Registry of live sockets.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Socket ID → socket info
    sockets: HashMap<u64, SocketInfo>,
    /// User ID → sockets bound to that user
    user_sockets: HashMap<String, BTreeSet<u64>>,
    /// Session ID → the socket currently holding it
    session_sockets: HashMap<String, u64>,
    /// Address → live sockets from it
    addr_counts: HashMap<IpAddr, usize>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an anonymous socket. Returns `false` if it already exists.
    pub fn register(&mut self, socket_id: u64, addr: IpAddr) -> bool {
        if self.sockets.contains_key(&socket_id) {
            return false;
        }
        self.sockets.insert(socket_id, SocketInfo::new(addr));
        *self.addr_counts.entry(addr).or_default() += 1;
        true
    }

    /// Bind a socket to an identity.
    ///
    /// Returns the socket that held the same session before, which the
    /// caller supersedes. Returns `None` if `socket_id` is unknown or no
    /// other socket held the session.
    pub fn bind(&mut self, socket_id: u64, identity: Identity) -> Option<u64> {
        let info = self.sockets.get_mut(&socket_id)?;

        if let Some(old) = info.identity.take() {
            Self::unlink(&mut self.user_sockets, &mut self.session_sockets, socket_id, &old);
        }

        self.user_sockets.entry(identity.user_id.clone()).or_default().insert(socket_id);
        let previous = self.session_sockets.insert(identity.session_id.clone(), socket_id);
        info.identity = Some(identity);

        previous.filter(|&prev| prev != socket_id)
    }

    fn unlink(
        user_sockets: &mut HashMap<String, BTreeSet<u64>>,
        session_sockets: &mut HashMap<String, u64>,
        socket_id: u64,
        identity: &Identity,
    ) {
        if let Some(sockets) = user_sockets.get_mut(&identity.user_id) {
            sockets.remove(&socket_id);
            if sockets.is_empty() {
                user_sockets.remove(&identity.user_id);
            }
        }
        if session_sockets.get(&identity.session_id) == Some(&socket_id) {
            session_sockets.remove(&identity.session_id);
        }
    }

    /// Unregister a socket and clean up every index.
    pub fn unregister(&mut self, socket_id: u64) -> Option<SocketInfo> {
        let info = self.sockets.remove(&socket_id)?;

        if let Some(identity) = &info.identity {
            Self::unlink(&mut self.user_sockets, &mut self.session_sockets, socket_id, identity);
        }
        if let Some(count) = self.addr_counts.get_mut(&info.addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.addr_counts.remove(&info.addr);
            }
        }
        Some(info)
    }

    /// Socket metadata. `None` if the socket doesn't exist.
    pub fn socket(&self, socket_id: u64) -> Option<&SocketInfo> {
        self.sockets.get(&socket_id)
    }

    /// Identity of a handshaken socket.
    pub fn identity(&self, socket_id: u64) -> Option<&Identity> {
        self.sockets.get(&socket_id).and_then(|s| s.identity.as_ref())
    }

    /// Check if a socket is registered.
    pub fn has_socket(&self, socket_id: u64) -> bool {
        self.sockets.contains_key(&socket_id)
    }

    /// All sockets bound to `user_id`.
    pub fn sockets_for_user(&self, user_id: &str) -> impl Iterator<Item = u64> + '_ {
        self.user_sockets.get(user_id).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Number of sockets bound to `user_id`.
    pub fn user_socket_count(&self, user_id: &str) -> usize {
        self.user_sockets.get(user_id).map_or(0, BTreeSet::len)
    }

    /// Socket currently holding `session_id`.
    pub fn socket_for_session(&self, session_id: &str) -> Option<u64> {
        self.session_sockets.get(session_id).copied()
    }

    /// Live sockets from `addr`.
    pub fn addr_count(&self, addr: IpAddr) -> usize {
        self.addr_counts.get(&addr).copied().unwrap_or(0)
    }

    /// Total number of registered sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Distinct users with at least one socket.
    pub fn user_count(&self) -> usize {
        self.user_sockets.len()
    }

    /// Every registered socket id.
    pub fn socket_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sockets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    fn identity(user: &str, session: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            device_id: "d".to_string(),
            session_id: session.to_string(),
        }
    }

    #[test]
    fn register_duplicate_socket_fails() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register(1, ADDR));
        assert!(!registry.register(1, ADDR));
        assert_eq!(registry.addr_count(ADDR), 1);
    }

    #[test]
    fn bind_indexes_user_and_session() {
        let mut registry = ConnectionRegistry::new();
        registry.register(1, ADDR);
        registry.register(2, ADDR);

        assert_eq!(registry.bind(1, identity("alice", "s1")), None);
        assert_eq!(registry.bind(2, identity("alice", "s2")), None);

        let sockets: Vec<_> = registry.sockets_for_user("alice").collect();
        assert_eq!(sockets, vec![1, 2]);
        assert_eq!(registry.socket_for_session("s2"), Some(2));
        assert_eq!(registry.user_count(), 1);
    }

    #[test]
    fn rebinding_a_session_reports_the_previous_socket() {
        let mut registry = ConnectionRegistry::new();
        registry.register(1, ADDR);
        registry.register(2, ADDR);

        registry.bind(1, identity("alice", "s1"));
        assert_eq!(registry.bind(2, identity("alice", "s1")), Some(1));
        assert_eq!(registry.socket_for_session("s1"), Some(2));

        // Unregistering the superseded socket must not drop the new holder
        registry.unregister(1);
        assert_eq!(registry.socket_for_session("s1"), Some(2));
        assert_eq!(registry.sockets_for_user("alice").collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn unregister_cleans_up_every_index() {
        let mut registry = ConnectionRegistry::new();
        registry.register(1, ADDR);
        registry.bind(1, identity("alice", "s1"));

        let info = registry.unregister(1).unwrap();
        assert_eq!(info.user_id(), Some("alice"));
        assert_eq!(registry.user_socket_count("alice"), 0);
        assert_eq!(registry.socket_for_session("s1"), None);
        assert_eq!(registry.addr_count(ADDR), 0);
        assert!(registry.unregister(1).is_none());
    }

    #[test]
    fn bind_unknown_socket_is_ignored() {
        let mut registry = ConnectionRegistry::new();
        assert_eq!(registry.bind(9, identity("alice", "s1")), None);
        assert_eq!(registry.socket_for_session("s1"), None);
    }
}
