//! Ephemeral user state: presence and typing indicators.
//!
//! Presence is what other users see. It is demoted to offline after a quiet
//! period regardless of transport health, which the lifecycle manager tracks
//! on its own.

use std::{collections::HashMap, time::Duration};

use courier_core::{Instant, TimerWheel};
use courier_proto::PresenceStatus;

#[derive(Debug, Clone, Copy)]
struct Entry<I> {
    status: PresenceStatus,
    last_activity: I,
}

/// Presence and typing state.
#[derive(Debug, Clone)]
pub struct PresenceBook<I: Instant> {
    entries: HashMap<String, Entry<I>>,
    typing: TimerWheel<I, (String, String)>,
    presence_timeout: Duration,
    typing_timeout: Duration,
}

/// Status shown to other users: invisible looks offline.
pub fn visible(status: PresenceStatus) -> PresenceStatus {
    match status {
        PresenceStatus::Invisible => PresenceStatus::Offline,
        other => other,
    }
}

impl<I: Instant> PresenceBook<I> {
    /// Empty book.
    pub fn new(presence_timeout: Duration, typing_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), typing: TimerWheel::new(), presence_timeout, typing_timeout }
    }

    /// Current status; offline when unknown.
    pub fn status(&self, user: &str) -> PresenceStatus {
        self.entries.get(user).map_or(PresenceStatus::Offline, |e| e.status)
    }

    /// Set `user`'s status. Returns the visible status if it changed.
    pub fn set(&mut self, user: &str, status: PresenceStatus, now: I) -> Option<PresenceStatus> {
        let before = visible(self.status(user));
        self.entries.insert(user.to_string(), Entry { status, last_activity: now });
        let after = visible(status);
        (before != after).then_some(after)
    }

    /// Record activity. A user swept to offline comes back online.
    pub fn touch(&mut self, user: &str, now: I) -> Option<PresenceStatus> {
        match self.entries.get_mut(user) {
            Some(entry) if entry.status != PresenceStatus::Offline => {
                entry.last_activity = now;
                None
            },
            _ => self.set(user, PresenceStatus::Online, now),
        }
    }

    /// Mark `user` offline. Returns the visible status if it changed.
    pub fn clear(&mut self, user: &str, now: I) -> Option<PresenceStatus> {
        self.typing.cancel_where(|(u, _)| u == user);
        self.set(user, PresenceStatus::Offline, now)
    }

    /// Demote users quiet for longer than the presence timeout. Returns the
    /// users whose visible status changed.
    pub fn sweep(&mut self, now: I) -> Vec<String> {
        let timeout = self.presence_timeout;
        let mut demoted = Vec::new();
        for (user, entry) in &mut self.entries {
            if entry.status != PresenceStatus::Offline && now - entry.last_activity >= timeout {
                let was_visible = visible(entry.status) != PresenceStatus::Offline;
                entry.status = PresenceStatus::Offline;
                if was_visible {
                    demoted.push(user.clone());
                }
            }
        }
        demoted.sort();
        demoted
    }

    /// Start or restart `user`'s typing indicator in `room`. Returns true if
    /// the user was not already typing there.
    pub fn start_typing(&mut self, user: &str, room: &str, now: I) -> bool {
        let key = (user.to_string(), room.to_string());
        let fresh = !self.typing.contains(&key);
        self.typing.schedule(key, now + self.typing_timeout);
        fresh
    }

    /// Stop the indicator. Returns true if it was active.
    pub fn stop_typing(&mut self, user: &str, room: &str) -> bool {
        self.typing.cancel(&(user.to_string(), room.to_string()))
    }

    /// Stop every indicator `user` has in `room`, or everywhere when `room`
    /// is `None`.
    pub fn stop_all_typing(&mut self, user: &str, room: Option<&str>) -> usize {
        self.typing.cancel_where(|(u, r)| u == user && room.is_none_or(|room| r == room))
    }

    /// Whether the indicator is active.
    pub fn is_typing(&self, user: &str, room: &str) -> bool {
        self.typing.contains(&(user.to_string(), room.to_string()))
    }

    /// Indicators that expired by `now`, as `(user, room)`.
    pub fn expired_typing(&mut self, now: I) -> Vec<(String, String)> {
        self.typing.poll_expired(now)
    }

    /// Active typing indicators.
    pub fn typing_count(&self) -> usize {
        self.typing.len()
    }

    /// Users currently not offline.
    pub fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.status != PresenceStatus::Offline).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(v: u64) -> Duration {
        Duration::from_secs(v)
    }

    fn book() -> PresenceBook<Duration> {
        PresenceBook::new(secs(300), secs(10))
    }

    #[test]
    fn invisible_is_shown_as_offline() {
        let mut book = book();
        assert_eq!(book.set("u", PresenceStatus::Online, secs(0)), Some(PresenceStatus::Online));
        assert_eq!(
            book.set("u", PresenceStatus::Invisible, secs(1)),
            Some(PresenceStatus::Offline)
        );
        assert_eq!(book.set("u", PresenceStatus::Offline, secs(2)), None);
    }

    #[test]
    fn sweep_demotes_quiet_users_only() {
        let mut book = book();
        book.set("quiet", PresenceStatus::Dnd, secs(0));
        book.set("busy", PresenceStatus::Online, secs(0));
        book.touch("busy", secs(200));

        assert_eq!(book.sweep(secs(300)), vec!["quiet".to_string()]);
        assert_eq!(book.status("quiet"), PresenceStatus::Offline);
        assert_eq!(book.status("busy"), PresenceStatus::Online);

        assert_eq!(book.touch("quiet", secs(301)), Some(PresenceStatus::Online));
    }

    #[test]
    fn typing_restart_does_not_stack() {
        let mut book = book();
        assert!(book.start_typing("u", "r", secs(0)));
        assert!(!book.start_typing("u", "r", secs(8)));

        assert!(book.expired_typing(secs(10)).is_empty());
        assert_eq!(book.expired_typing(secs(18)), vec![("u".to_string(), "r".to_string())]);
        assert!(!book.is_typing("u", "r"));
    }

    #[test]
    fn stop_all_typing_scoped_to_room() {
        let mut book = book();
        book.start_typing("u", "r1", secs(0));
        book.start_typing("u", "r2", secs(0));
        assert_eq!(book.stop_all_typing("u", Some("r1")), 1);
        assert!(book.is_typing("u", "r2"));
        assert_eq!(book.stop_all_typing("u", None), 1);
        assert_eq!(book.typing_count(), 0);
    }
}
