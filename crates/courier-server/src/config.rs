//! Server configuration.
//!
//! One immutable [`CourierConfig`] is built at startup and handed to every
//! component by reference. Layers, later overriding earlier:
//!
//! 1. Compiled defaults
//! 2. Optional TOML file (`--config`)
//! 3. `COURIER_*` environment variables, `__` separating sections
//!    (`COURIER_QUEUE__BATCH_SIZE=50`)
//!
//! Durations are stored as milliseconds so the file format stays plain
//! integers; accessors convert them.

use std::{path::Path, time::Duration};

use courier_core::{
    BackoffPolicy, BreakerConfig, DeliveryLimits, DeliveryOptions, connection::MonitorConfig,
    rate_limit::SendLimits,
};
use courier_proto::Priority;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A layer could not be read or parsed
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parsed but are not usable
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CourierConfig {
    /// Process-level settings
    pub server: ServerSection,
    /// Connection Lifecycle Manager
    pub lifecycle: LifecycleConfig,
    /// Message Delivery Queue
    pub queue: QueueConfig,
    /// Pub/sub fabric
    pub fabric: FabricConfig,
    /// Room & presence directory
    pub directory: DirectoryConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Instance identity, used for loop prevention and message ownership
    pub server_id: String,
    /// UDP address to bind
    pub bind_address: String,
    /// Lifecycle, fabric and directory timer tick
    pub tick_interval_ms: u64,
    /// Queue-processing tick
    pub queue_tick_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            server_id: "courier-1".to_string(),
            bind_address: "0.0.0.0:4433".to_string(),
            tick_interval_ms: 1_000,
            queue_tick_interval_ms: 100,
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Server ping interval
    pub heartbeat_interval_ms: u64,
    /// How long a disconnected session stays restorable
    pub session_timeout_ms: u64,
    /// First reconnection probe delay
    pub reconnect_initial_delay_ms: u64,
    /// Probe delay growth factor
    pub reconnect_multiplier: f64,
    /// Probe delay cap
    pub reconnect_max_delay_ms: u64,
    /// Probes before the session fails
    pub reconnect_max_attempts: u32,
    /// Admission window length
    pub admission_window_ms: u64,
    /// New connections allowed per address per window
    pub admission_max_per_window: u32,
    /// Global connection ceiling
    pub max_connections: usize,
    /// Per-user connection ceiling
    pub max_per_user: usize,
    /// Per-address connection ceiling
    pub max_per_ip: usize,
    /// Frames buffered per session while its link is being re-established
    pub pending_buffer: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            session_timeout_ms: 30 * 60 * 1_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_multiplier: 2.0,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
            admission_window_ms: 60_000,
            admission_max_per_window: 10,
            max_connections: 10_000,
            max_per_user: 5,
            max_per_ip: 10,
            pending_buffer: 100,
        }
    }
}

impl LifecycleConfig {
    /// Reconnection probe schedule.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    /// Heartbeat monitor settings.
    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            backoff: self.backoff(),
        }
    }

    /// Deferred eviction delay.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Admission window length.
    pub fn admission_window(&self) -> Duration {
        Duration::from_millis(self.admission_window_ms)
    }
}

/// Message delivery queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Messages taken from one lane per tick
    pub batch_size: usize,
    /// Dead-letter high-water mark
    pub dead_letter_capacity: usize,
    /// Durable record TTL
    pub message_ttl_ms: u64,
    /// Durable record TTL for `persist_until_read` chat content
    pub persisted_chat_ttl_ms: u64,
    /// Failures before the delivery breaker opens
    pub breaker_threshold: u32,
    /// Open period before a probe is allowed
    pub breaker_recovery_ms: u64,
    /// Steady rate window
    pub rate_window_ms: u64,
    /// Sends per steady window
    pub rate_max_per_window: u32,
    /// Burst window
    pub burst_window_ms: u64,
    /// Sends per burst window
    pub burst_limit: u32,
    /// Penalty after a burst overflow
    pub penalty_ms: u64,
    /// Default delivery attempts
    pub max_retries: u32,
    /// Default base retry delay
    pub retry_delay_ms: u64,
    /// Default ack window
    pub ack_timeout_ms: u64,
    /// Undelivered messages kept per offline user
    pub offline_mailbox_len: usize,
    /// Offline mailbox TTL
    pub offline_mailbox_ttl_ms: u64,
    /// Delivery latency samples kept for the average
    pub latency_samples: usize,
    /// Highest lane a client may request
    pub client_priority_ceiling: Priority,
    /// Most delivery attempts a client may request
    pub max_client_retries: u32,
    /// Longest base retry delay a client may request
    pub max_retry_delay_ms: u64,
    /// Shortest ack window a client may request
    pub min_ack_timeout_ms: u64,
    /// Longest ack window a client may request
    pub max_ack_timeout_ms: u64,
    /// Furthest ahead a client may schedule a message
    pub max_schedule_ahead_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dead_letter_capacity: 10_000,
            message_ttl_ms: 24 * 60 * 60 * 1_000,
            persisted_chat_ttl_ms: 7 * 24 * 60 * 60 * 1_000,
            breaker_threshold: 5,
            breaker_recovery_ms: 30_000,
            rate_window_ms: 60_000,
            rate_max_per_window: 120,
            burst_window_ms: 1_000,
            burst_limit: 10,
            penalty_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            ack_timeout_ms: 30_000,
            offline_mailbox_len: 100,
            offline_mailbox_ttl_ms: 7 * 24 * 60 * 60 * 1_000,
            latency_samples: 1_000,
            client_priority_ceiling: Priority::High,
            max_client_retries: 10,
            max_retry_delay_ms: 60_000,
            min_ack_timeout_ms: 1_000,
            max_ack_timeout_ms: 5 * 60 * 1_000,
            max_schedule_ahead_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

impl QueueConfig {
    /// Options applied to unset `queue:send` fields.
    pub fn delivery_defaults(&self) -> DeliveryOptions {
        DeliveryOptions {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            timeout_ms: self.ack_timeout_ms,
            ..DeliveryOptions::default()
        }
    }

    /// Bounds on client-chosen delivery options.
    pub fn delivery_limits(&self) -> DeliveryLimits {
        DeliveryLimits {
            priority_ceiling: self.client_priority_ceiling,
            max_retries: self.max_client_retries,
            max_retry_delay_ms: self.max_retry_delay_ms,
            min_timeout_ms: self.min_ack_timeout_ms,
            max_timeout_ms: self.max_ack_timeout_ms,
            max_schedule_ahead_ms: self.max_schedule_ahead_ms,
        }
    }

    /// Per-user send limits.
    pub fn send_limits(&self) -> SendLimits {
        SendLimits {
            window: Duration::from_millis(self.rate_window_ms),
            max_per_window: self.rate_max_per_window,
            burst_window: Duration::from_millis(self.burst_window_ms),
            burst_limit: self.burst_limit,
            penalty: Duration::from_millis(self.penalty_ms),
        }
    }

    /// Delivery breaker settings.
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold,
            recovery_timeout: Duration::from_millis(self.breaker_recovery_ms),
        }
    }
}

/// Pub/sub fabric settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FabricConfig {
    /// Messages held locally while the broker is unreachable
    pub offline_capacity: usize,
    /// Recently seen message keys kept for duplicate suppression
    pub dedupe_capacity: usize,
    /// Bodies larger than this are compressed; 0 disables compression
    pub compression_threshold: usize,
    /// Health probe interval
    pub health_interval_ms: u64,
    /// Probe latency above this counts as slow
    pub slow_threshold_ms: u64,
    /// Consecutive slow probes before health is reported degraded
    pub degraded_after: u32,
    /// Consecutive failed operations before the fabric breaker opens
    pub breaker_threshold: u32,
    /// Open period before a probe is allowed
    pub breaker_recovery_ms: u64,
    /// Messages taken from the broker per poll
    pub poll_batch: usize,
    /// Offline-queue expiry for messages published without a TTL
    pub default_ttl_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            offline_capacity: 1_000,
            dedupe_capacity: 10_000,
            compression_threshold: 1_024,
            health_interval_ms: 10_000,
            slow_threshold_ms: 1_000,
            degraded_after: 3,
            breaker_threshold: 5,
            breaker_recovery_ms: 30_000,
            poll_batch: 1_000,
            default_ttl_ms: 5 * 60 * 1_000,
        }
    }
}

impl FabricConfig {
    /// Fabric breaker settings.
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold,
            recovery_timeout: Duration::from_millis(self.breaker_recovery_ms),
        }
    }

    /// Compression threshold, `None` when disabled.
    pub fn compress_above(&self) -> Option<usize> {
        (self.compression_threshold > 0).then_some(self.compression_threshold)
    }
}

/// Room and presence directory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Typing indicator lifetime
    pub typing_timeout_ms: u64,
    /// Inactivity before presence is demoted to offline
    pub presence_timeout_ms: u64,
    /// Empty rooms idle longer than this are removed
    pub room_idle_threshold_ms: u64,
    /// Room record TTL in the broker
    pub room_ttl_ms: u64,
    /// Chat messages kept per room for `room:joined`
    pub recent_history: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            typing_timeout_ms: 10_000,
            presence_timeout_ms: 5 * 60 * 1_000,
            room_idle_threshold_ms: 24 * 60 * 60 * 1_000,
            room_ttl_ms: 24 * 60 * 60 * 1_000,
            recent_history: 50,
        }
    }
}

impl CourierConfig {
    /// Load defaults, then `path` if given, then `COURIER_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self =
            figment.merge(Env::prefixed("COURIER_").split("__")).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document over the defaults. No environment layer.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with. Collects every problem
    /// instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, msg: &str| {
            if !ok {
                errors.push(msg.to_string());
            }
        };

        check(!self.server.server_id.trim().is_empty(), "server.server_id must not be empty");
        check(self.server.tick_interval_ms > 0, "server.tick_interval_ms must be positive");
        check(
            self.server.queue_tick_interval_ms > 0,
            "server.queue_tick_interval_ms must be positive",
        );

        let lc = &self.lifecycle;
        check(lc.heartbeat_interval_ms > 0, "lifecycle.heartbeat_interval_ms must be positive");
        check(lc.reconnect_multiplier >= 1.0, "lifecycle.reconnect_multiplier must be >= 1.0");
        check(
            lc.reconnect_max_delay_ms >= lc.reconnect_initial_delay_ms,
            "lifecycle.reconnect_max_delay_ms must be >= reconnect_initial_delay_ms",
        );
        check(lc.reconnect_max_attempts > 0, "lifecycle.reconnect_max_attempts must be positive");
        check(lc.max_connections > 0, "lifecycle.max_connections must be positive");
        check(lc.max_per_user > 0, "lifecycle.max_per_user must be positive");
        check(lc.max_per_ip > 0, "lifecycle.max_per_ip must be positive");

        let q = &self.queue;
        check(q.batch_size > 0, "queue.batch_size must be positive");
        check(q.dead_letter_capacity > 0, "queue.dead_letter_capacity must be positive");
        check(q.breaker_threshold > 0, "queue.breaker_threshold must be positive");
        check(q.burst_limit > 0, "queue.burst_limit must be positive");
        check(q.rate_max_per_window > 0, "queue.rate_max_per_window must be positive");
        check(q.max_retries > 0, "queue.max_retries must be positive");
        check(q.max_client_retries > 0, "queue.max_client_retries must be positive");
        check(
            q.max_ack_timeout_ms >= q.min_ack_timeout_ms,
            "queue.max_ack_timeout_ms must be >= min_ack_timeout_ms",
        );

        let f = &self.fabric;
        check(f.offline_capacity > 0, "fabric.offline_capacity must be positive");
        check(f.dedupe_capacity > 0, "fabric.dedupe_capacity must be positive");
        check(f.breaker_threshold > 0, "fabric.breaker_threshold must be positive");
        check(f.health_interval_ms > 0, "fabric.health_interval_ms must be positive");
        check(f.poll_batch > 0, "fabric.poll_batch must be positive");

        check(self.directory.typing_timeout_ms > 0, "directory.typing_timeout_ms must be positive");

        if errors.is_empty() { Ok(()) } else { Err(ConfigError::Invalid(errors)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CourierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.batch_size, 100);
        assert_eq!(config.lifecycle.max_per_user, 5);
        assert_eq!(config.lifecycle.session_timeout(), Duration::from_secs(1_800));
        assert_eq!(config.directory.typing_timeout_ms, 10_000);
    }

    #[test]
    fn toml_overrides_single_fields() {
        let config = CourierConfig::from_toml(
            r#"
            [server]
            server_id = "edge-7"

            [queue]
            batch_size = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.server.server_id, "edge-7");
        assert_eq!(config.queue.batch_size, 25);
        assert_eq!(config.queue.burst_limit, QueueConfig::default().burst_limit);
    }

    #[test]
    fn invalid_values_are_collected() {
        let err = CourierConfig::from_toml(
            r"
            [queue]
            batch_size = 0
            breaker_threshold = 0
            ",
        )
        .unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure, got {err}");
        };
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn client_limits_load_from_toml() {
        let config = CourierConfig::from_toml(
            r#"
            [queue]
            client_priority_ceiling = "normal"
            max_ack_timeout_ms = 10000
            "#,
        )
        .unwrap();
        let limits = config.queue.delivery_limits();
        assert_eq!(limits.priority_ceiling, Priority::Normal);
        assert_eq!(limits.max_timeout_ms, 10_000);
        assert_eq!(limits.min_timeout_ms, 1_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = CourierConfig::from_toml("[queue]\nbatchsize = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn zero_threshold_disables_compression() {
        let fabric = FabricConfig { compression_threshold: 0, ..FabricConfig::default() };
        assert_eq!(fabric.compress_above(), None);
        assert_eq!(FabricConfig::default().compress_above(), Some(1_024));
    }

    #[test]
    fn written_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, toml::to_string(&CourierConfig::default()).unwrap()).unwrap();

        let loaded = CourierConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.queue, QueueConfig::default());
        assert_eq!(loaded.directory.recent_history, 50);
    }
}
