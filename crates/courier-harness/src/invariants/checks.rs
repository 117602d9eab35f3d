//! Standard cluster invariants.

use std::collections::HashMap;

use super::{ClusterSnapshot, Invariant, InvariantResult, Violation};

/// No instance holds more sockets than its global or per-user ceiling.
pub struct ConnectionLimits;

impl Invariant for ConnectionLimits {
    fn name(&self) -> &'static str {
        "connection_limits"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        for instance in &state.instances {
            if instance.metrics.connections > instance.limits.max_connections {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "instance {}: {} connections over ceiling {}",
                        instance.index, instance.metrics.connections, instance.limits.max_connections
                    ),
                });
            }
            for (user, count) in &instance.user_sockets {
                if *count > instance.limits.max_per_user {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "instance {}: {user} holds {count} sockets, ceiling {}",
                            instance.index, instance.limits.max_per_user
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The dead-letter store never grows past its capacity.
pub struct DeadLetterBound;

impl Invariant for DeadLetterBound {
    fn name(&self) -> &'static str {
        "dead_letter_bound"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        for instance in &state.instances {
            if instance.metrics.dead_letters > instance.limits.dead_letter_capacity {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "instance {}: {} dead letters, capacity {}",
                        instance.index,
                        instance.metrics.dead_letters,
                        instance.limits.dead_letter_capacity
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Once the server closes a socket it sends nothing more to it.
pub struct ClosedSocketsStaySilent;

impl Invariant for ClosedSocketsStaySilent {
    fn name(&self) -> &'static str {
        "closed_sockets_stay_silent"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        match state.sockets.iter().find(|s| s.frames_after_close > 0) {
            Some(socket) => Err(Violation {
                invariant: self.name(),
                message: format!(
                    "socket {} got {} frames after closing",
                    socket.socket_id, socket.frames_after_close
                ),
            }),
            None => Ok(()),
        }
    }
}

/// Each instance counts exactly the sockets its clients hold open.
pub struct ConnectionAccounting;

impl Invariant for ConnectionAccounting {
    fn name(&self) -> &'static str {
        "connection_accounting"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        for instance in &state.instances {
            let open = state.open_sockets_on(instance.index);
            if instance.metrics.connections != open {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "instance {} counts {} connections, clients hold {open}",
                        instance.index, instance.metrics.connections
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A session is attached to at most one open socket cluster-wide.
pub struct SingleAttachment;

impl Invariant for SingleAttachment {
    fn name(&self) -> &'static str {
        "single_attachment"
    }

    fn check(&self, state: &ClusterSnapshot) -> InvariantResult {
        let mut owners: HashMap<&str, u64> = HashMap::new();
        for instance in &state.instances {
            for (socket_id, session_id) in &instance.bound_sessions {
                if let Some(other) = owners.insert(session_id, *socket_id) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "session {session_id} attached to sockets {other} and {socket_id}"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
