//! Point-in-time metrics for external monitoring.
//!
//! The driver assembles a [`MetricsSnapshot`] on demand; nothing here keeps
//! state of its own. The snapshot serializes to JSON-friendly field names so
//! the runtime can expose it as-is.

use courier_core::BreakerState;
use serde::Serialize;

use crate::{
    fabric::{FabricHealth, FabricStats},
    queue::QueueStats,
};

/// Queue depth per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneDepths {
    /// Urgent lane
    pub urgent: usize,
    /// High lane
    pub high: usize,
    /// Normal lane
    pub normal: usize,
    /// Low lane
    pub low: usize,
}

impl From<[usize; 4]> for LaneDepths {
    fn from([urgent, high, normal, low]: [usize; 4]) -> Self {
        Self { urgent, high, normal, low }
    }
}

impl LaneDepths {
    /// Messages across all lanes.
    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }
}

/// Everything an operator needs to judge instance health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Instance
    pub server_id: String,
    /// Unix millis at collection
    pub collected_at_ms: u64,

    /// Admitted sockets
    pub connections: usize,
    /// Distinct connected users
    pub users: usize,
    /// Sessions held, attached or detached
    pub sessions: usize,
    /// Sessions awaiting eviction
    pub detached_sessions: usize,

    /// Queued messages per lane
    pub lane_depths: LaneDepths,
    /// Sent, awaiting an ack
    pub in_flight: usize,
    /// Waiting out a retry delay
    pub retrying: usize,
    /// Dead letters held
    pub dead_letters: usize,
    /// Dead letters purged at the high-water mark since startup
    pub dead_letters_purged: u64,
    /// Delivery breaker
    pub queue_breaker: BreakerState,
    /// Queue counters
    pub queue: QueueStats,
    /// Mean delivery latency over recent samples
    pub average_latency_ms: f64,
    /// Delivery function errors over all attempts
    pub error_rate: f64,

    /// Fabric breaker
    pub fabric_breaker: BreakerState,
    /// Messages parked while the broker is unreachable
    pub fabric_offline: usize,
    /// Fabric counters, dedupe hits included
    pub fabric: FabricStats,
    /// Fabric health
    pub health: FabricHealth,

    /// Rooms known here
    pub rooms: usize,
    /// Local room memberships
    pub memberships: usize,
    /// Users not offline
    pub online_users: usize,
    /// Active typing indicators
    pub typing: usize,
}

impl MetricsSnapshot {
    /// Whether the instance can accept and deliver traffic.
    pub fn is_serving(&self) -> bool {
        self.queue_breaker != BreakerState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_depths_from_array() {
        let depths = LaneDepths::from([1, 2, 3, 4]);
        assert_eq!(depths.urgent, 1);
        assert_eq!(depths.low, 4);
        assert_eq!(depths.total(), 10);
    }
}
