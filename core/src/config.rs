// Runtime configuration for the mesh, delivery and hybrid layers
//
// Every knob has a default tuned for a phone-class device on a shared
// short-range radio. Hosts override individual fields through JSON; missing
// fields fall back to the defaults below.

use crate::retry::RetryBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

/// Top-level configuration handed to [`crate::node::LifelineNode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub mesh: MeshConfig,
    pub delivery: DeliveryConfig,
    pub hybrid: HybridConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mesh.validate()?;
        self.delivery.validate()?;
        self.hybrid.validate()
    }
}

/// Mesh transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Main service loop period
    pub loop_interval_ms: u64,
    /// Airtime given to each queued advertisement before the next one
    pub advertise_busy_ms: u64,
    pub heartbeat_default_ms: u64,
    pub heartbeat_active_ms: u64,
    pub heartbeat_idle_ms: u64,
    pub heartbeat_low_battery_ms: u64,
    /// Peers seen within this window count as "active"
    pub peer_active_window_ms: u64,
    /// With no peers for this long the heartbeat slows to idle
    pub peer_idle_cooldown_ms: u64,
    pub peer_stale_timeout_ms: u64,
    pub low_battery_percent: u8,
    pub default_ttl: u8,
    pub max_seen_ids: usize,
    pub max_queue_size: usize,
    pub high_drain_cap: usize,
    pub normal_drain_cap: usize,
    pub relay_drain_cap: usize,
    pub persist_debounce_ms: u64,
    /// Shared secret for sealing envelope payloads. `None` sends them in the clear.
    pub network_passphrase: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 1_000,
            advertise_busy_ms: 500,
            heartbeat_default_ms: 30_000,
            heartbeat_active_ms: 15_000,
            heartbeat_idle_ms: 60_000,
            heartbeat_low_battery_ms: 120_000,
            peer_active_window_ms: 30_000,
            peer_idle_cooldown_ms: 60_000,
            peer_stale_timeout_ms: 120_000,
            low_battery_percent: 20,
            default_ttl: 5,
            max_seen_ids: 2_000,
            max_queue_size: 200,
            high_drain_cap: 5,
            normal_drain_cap: 2,
            relay_drain_cap: 2,
            persist_debounce_ms: 1_000,
            network_passphrase: None,
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_interval_ms == 0 {
            return Err(invalid("mesh.loop_interval_ms must be greater than 0"));
        }
        if self.heartbeat_active_ms == 0
            || self.heartbeat_default_ms == 0
            || self.heartbeat_idle_ms == 0
            || self.heartbeat_low_battery_ms == 0
        {
            return Err(invalid("mesh heartbeat intervals must be greater than 0"));
        }
        if self.peer_stale_timeout_ms < 2 {
            return Err(invalid("mesh.peer_stale_timeout_ms is too small"));
        }
        if self.default_ttl == 0 {
            return Err(invalid("mesh.default_ttl must be at least 1"));
        }
        if self.max_seen_ids == 0 {
            return Err(invalid("mesh.max_seen_ids must be greater than 0"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("mesh.max_queue_size must be greater than 0"));
        }
        if self.low_battery_percent > 100 {
            return Err(invalid("mesh.low_battery_percent must be 0-100"));
        }
        if let Some(passphrase) = &self.network_passphrase {
            if passphrase.is_empty() {
                return Err(invalid("mesh.network_passphrase cannot be empty"));
            }
        }
        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn advertise_busy(&self) -> Duration {
        Duration::from_millis(self.advertise_busy_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Stale peers are swept twice per timeout window.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.peer_stale_timeout_ms / 2)
    }
}

/// ACK tracking tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub monitor_interval_ms: u64,
    pub retention_days: u64,
    pub persist_debounce_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_retries: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 16_000,
            monitor_interval_ms: 60_000,
            retention_days: 7,
            persist_debounce_ms: 1_000,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_timeout_ms == 0 {
            return Err(invalid("delivery.ack_timeout_ms must be greater than 0"));
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(invalid("delivery.retry_base_ms must not exceed retry_max_ms"));
        }
        if self.monitor_interval_ms == 0 {
            return Err(invalid("delivery.monitor_interval_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    /// Retry schedule indexed by retry count (1s, 2s, 4s, ... capped).
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::doubling(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Hybrid (mesh + cloud) orchestration tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub max_queue_size: usize,
    pub max_failed_kept: usize,
    pub max_seen_ids: usize,
    pub max_awaiting_ack: usize,
    pub persist_debounce_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_attempts: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Backoff cap for critical-priority messages
    pub critical_retry_max_delay_ms: u64,
    pub typing_throttle_ms: u64,
    pub typing_debounce_ms: u64,
    pub typing_auto_clear_ms: u64,
    pub connection_check_interval_ms: u64,
    pub queue_process_interval_ms: u64,
    pub max_content_len: usize,
    /// Store-and-forward entries kept per recipient
    pub mailbox_per_peer: usize,
    pub mailbox_expiry_ms: u64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            max_failed_kept: 100,
            max_seen_ids: 5_000,
            max_awaiting_ack: 256,
            persist_debounce_ms: 1_000,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_multiplier: 2.0,
            retry_max_attempts: 10,
            jitter_min: 0.5,
            jitter_max: 1.5,
            critical_retry_max_delay_ms: 5_000,
            typing_throttle_ms: 2_000,
            typing_debounce_ms: 3_000,
            typing_auto_clear_ms: 5_000,
            connection_check_interval_ms: 5_000,
            queue_process_interval_ms: 5_000,
            max_content_len: 5_000,
            mailbox_per_peer: 100,
            mailbox_expiry_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(invalid("hybrid.max_queue_size must be greater than 0"));
        }
        if self.max_seen_ids == 0 || self.max_awaiting_ack == 0 {
            return Err(invalid("hybrid cache capacities must be greater than 0"));
        }
        if self.retry_multiplier < 1.0 {
            return Err(invalid("hybrid.retry_multiplier must be at least 1.0"));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(invalid(
                "hybrid.retry_initial_delay_ms must not exceed retry_max_delay_ms",
            ));
        }
        if !(self.jitter_min > 0.0 && self.jitter_min < self.jitter_max) {
            return Err(invalid("hybrid jitter band must satisfy 0 < jitter_min < jitter_max"));
        }
        if self.connection_check_interval_ms == 0 || self.queue_process_interval_ms == 0 {
            return Err(invalid("hybrid polling intervals must be greater than 0"));
        }
        if self.max_content_len == 0 {
            return Err(invalid("hybrid.max_content_len must be greater than 0"));
        }
        if self.mailbox_per_peer == 0 || self.mailbox_expiry_ms == 0 {
            return Err(invalid("hybrid mailbox limits must be greater than 0"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff {
            initial: Duration::from_millis(self.retry_initial_delay_ms),
            max: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            jitter: Some((self.jitter_min, self.jitter_max)),
        }
    }

    /// Same schedule with the tighter cap used for critical messages.
    pub fn critical_backoff(&self) -> RetryBackoff {
        self.backoff()
            .with_max(Duration::from_millis(self.critical_retry_max_delay_ms))
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.connection_check_interval_ms)
    }

    pub fn queue_process_interval(&self) -> Duration {
        Duration::from_millis(self.queue_process_interval_ms)
    }
}
