//! Observable cluster state for invariant checking.
//!
//! Invariants run against a snapshot rather than live drivers so one check
//! sees one consistent moment.

use std::collections::BTreeMap;

use courier_server::MetricsSnapshot;

/// Snapshot of every live instance and every simulated socket.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Live instances
    pub instances: Vec<InstanceSnapshot>,
    /// Every socket the simulation ever opened
    pub sockets: Vec<SocketSnapshot>,
}

impl ClusterSnapshot {
    /// Snapshot with nothing in it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Open sockets attached to a live `instance`.
    pub fn open_sockets_on(&self, instance: usize) -> usize {
        self.sockets.iter().filter(|s| s.instance == instance && s.open && s.instance_live).count()
    }
}

/// Configured ceilings of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Global socket ceiling
    pub max_connections: usize,
    /// Sockets per user
    pub max_per_user: usize,
    /// Dead-letter store capacity
    pub dead_letter_capacity: usize,
}

/// One live instance.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    /// Position in the cluster
    pub index: usize,
    /// Metrics at snapshot time
    pub metrics: MetricsSnapshot,
    /// Configured ceilings
    pub limits: Limits,
    /// Live sockets per user, users with none omitted
    pub user_sockets: BTreeMap<String, usize>,
    /// Session bound to each open socket
    pub bound_sessions: Vec<(u64, String)>,
}

/// One simulated socket as the client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSnapshot {
    /// Socket id
    pub socket_id: u64,
    /// Instance it was opened against
    pub instance: usize,
    /// Whether that instance is currently running
    pub instance_live: bool,
    /// Not yet closed by either side
    pub open: bool,
    /// Frames addressed to it after it closed
    pub frames_after_close: usize,
}
