//! Per-connection heartbeat monitor.
//!
//! Tracks liveness of one socket and drives the degradation and reconnection
//! state machine. Uses the action pattern: methods take time as input and
//! return actions for the driver to execute.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────┐ 1 missed ┌──────────────────┐ 2 missed ┌─────────────────┐
//! │ Connected │─────────>│ Degraded(partial)│─────────>│ Degraded(severe)│
//! └───────────┘          └──────────────────┘          └─────────────────┘
//!       ^                        │ pong                          │
//!       │<───────────────────────┘                               v
//!       │              pong                            ┌──────────────────┐
//!       └──────────────────────────────────────────────│ Reconnecting{n}  │
//!                                                      └──────────────────┘
//!                                                               │ n > max
//!                                                               v
//!                                                          ┌────────┐
//!                                                          │ Failed │
//!                                                          └────────┘
//! ```
//!
//! While reconnecting the server keeps probing with pings on a capped
//! exponential backoff. A pong at any point before `Failed` restores the link.

use std::time::Duration;

use crate::{backoff::BackoffPolicy, env::Instant, session::DegradationLevel};

/// Default interval between server pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Heartbeats answered
    Connected,
    /// Heartbeats being missed
    Degraded(DegradationLevel),
    /// Probing with backoff; `attempt` is the next probe number
    Reconnecting {
        /// Next probe number (1-based)
        attempt: u32,
    },
    /// Probes exhausted. Terminal.
    Failed,
}

/// Actions returned by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Send a heartbeat ping on the socket
    SendPing,
    /// Degradation level changed
    Degraded(DegradationLevel),
    /// Reconnection episode started or advanced
    Reconnecting {
        /// Probe number about to be scheduled
        attempt: u32,
        /// Wait before that probe
        delay: Duration,
    },
    /// A pong arrived while degraded or reconnecting
    Recovered,
    /// Probes exhausted; the session must be evicted
    Failed {
        /// Probes made
        attempts: u32,
    },
}

/// Monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorConfig {
    /// Ping interval
    pub heartbeat_interval: Duration,
    /// Reconnection probe schedule
    pub backoff: BackoffPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL, backoff: BackoffPolicy::default() }
    }
}

/// Heartbeat monitor for one connection.
///
/// Generic over the instant type so simulations can drive it with virtual
/// time.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor<I> {
    config: MonitorConfig,
    state: LinkState,
    interval_started: I,
    awaiting_pong: bool,
    missed: u32,
    next_probe_at: Option<I>,
    last_pong: Option<I>,
}

impl<I: Instant> ConnectionMonitor<I> {
    /// Start monitoring at `now`. The first ping goes out one interval later.
    #[must_use]
    pub fn new(now: I, config: MonitorConfig) -> Self {
        Self {
            config,
            state: LinkState::Connected,
            interval_started: now,
            awaiting_pong: false,
            missed: 0,
            next_probe_at: None,
            last_pong: None,
        }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Degradation level implied by the link state.
    #[must_use]
    pub fn degradation(&self) -> DegradationLevel {
        match self.state {
            LinkState::Connected => DegradationLevel::None,
            LinkState::Degraded(level) => level,
            LinkState::Reconnecting { .. } | LinkState::Failed => DegradationLevel::Severe,
        }
    }

    /// Intervals missed since the last pong.
    #[must_use]
    pub fn missed_intervals(&self) -> u32 {
        self.missed
    }

    /// Time of the last pong.
    #[must_use]
    pub fn last_pong(&self) -> Option<I> {
        self.last_pong
    }

    /// Earliest time `tick` has something to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        match self.state {
            LinkState::Connected | LinkState::Degraded(_) => {
                Some(self.interval_started + self.config.heartbeat_interval)
            },
            LinkState::Reconnecting { .. } => self.next_probe_at,
            LinkState::Failed => None,
        }
    }

    /// Advance to `now`. `jitter` is a uniform sample in `[0, 1)` used only if
    /// a reconnection probe has to be scheduled.
    pub fn tick(&mut self, now: I, jitter: f64) -> Vec<MonitorAction> {
        match self.state {
            LinkState::Connected | LinkState::Degraded(_) => self.tick_heartbeat(now, jitter),
            LinkState::Reconnecting { attempt } => self.tick_reconnect(now, attempt, jitter),
            LinkState::Failed => Vec::new(),
        }
    }

    fn tick_heartbeat(&mut self, now: I, jitter: f64) -> Vec<MonitorAction> {
        let mut actions = Vec::new();
        if now - self.interval_started < self.config.heartbeat_interval {
            return actions;
        }

        self.interval_started = now;
        if self.awaiting_pong {
            self.missed += 1;
        }

        match self.missed {
            0 => {},
            1 => {
                if self.state != LinkState::Degraded(DegradationLevel::Partial) {
                    self.state = LinkState::Degraded(DegradationLevel::Partial);
                    actions.push(MonitorAction::Degraded(DegradationLevel::Partial));
                }
            },
            _ => {
                self.state = LinkState::Degraded(DegradationLevel::Severe);
                actions.push(MonitorAction::Degraded(DegradationLevel::Severe));
                actions.push(self.schedule_probe(now, 1, jitter));
                return actions;
            },
        }

        self.awaiting_pong = true;
        actions.push(MonitorAction::SendPing);
        actions
    }

    fn tick_reconnect(&mut self, now: I, attempt: u32, jitter: f64) -> Vec<MonitorAction> {
        let Some(due) = self.next_probe_at else {
            return Vec::new();
        };
        if now < due {
            return Vec::new();
        }

        if self.config.backoff.exhausted(attempt) {
            self.state = LinkState::Failed;
            self.next_probe_at = None;
            return vec![MonitorAction::Failed { attempts: attempt - 1 }];
        }

        self.awaiting_pong = true;
        vec![MonitorAction::SendPing, self.schedule_probe(now, attempt + 1, jitter)]
    }

    fn schedule_probe(&mut self, now: I, attempt: u32, jitter: f64) -> MonitorAction {
        let delay = self.config.backoff.delay(attempt, jitter);
        self.state = LinkState::Reconnecting { attempt };
        self.next_probe_at = Some(now + delay);
        MonitorAction::Reconnecting { attempt, delay }
    }

    /// A heartbeat reply arrived. Returns `Recovered` if the link was degraded
    /// or reconnecting. Pongs after `Failed` are ignored.
    pub fn handle_pong(&mut self, now: I) -> Option<MonitorAction> {
        if self.state == LinkState::Failed {
            return None;
        }

        self.last_pong = Some(now);
        self.awaiting_pong = false;
        self.missed = 0;
        self.next_probe_at = None;

        if self.state == LinkState::Connected {
            None
        } else {
            self.state = LinkState::Connected;
            self.interval_started = now;
            Some(MonitorAction::Recovered)
        }
    }
}
