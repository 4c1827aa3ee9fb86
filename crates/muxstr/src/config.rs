//! Tunables for the pool. Every struct carries its production defaults and
//! can be partially overridden from JSON.

use std::time::Duration;

use serde::Deserialize;

use crate::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub supervisor: SupervisorConfig,
    pub keepalive: KeepaliveConfig,
    pub batch: BatchConfig,
    pub ledger: LedgerConfig,
    pub system_disconnect: SystemDisconnectConfig,
}

impl PoolConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// how often a connected relay's transport state is compared against ours
    pub state_check_interval_ms: u64,
    pub sleep_check_interval_ms: u64,
    /// a wall clock jump larger than this between sleep checks means the
    /// host was suspended
    pub sleep_gap_threshold_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// reconnection delays used after a stale connection or a wake,
    /// indexed by attempt and clamped to the last entry
    pub idle_schedule_ms: Vec<u64>,
    pub flapping_threshold_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_check_interval_ms: 5_000,
            sleep_check_interval_ms: 10_000,
            sleep_gap_threshold_ms: 15_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            idle_schedule_ms: vec![0, 1_000, 2_000, 5_000, 10_000, 30_000],
            flapping_threshold_ms: 1_000,
        }
    }
}

impl SupervisorConfig {
    pub fn state_check_interval(&self) -> Duration {
        Duration::from_millis(self.state_check_interval_ms)
    }

    pub fn sleep_check_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_check_interval_ms)
    }

    pub fn sleep_gap_threshold(&self) -> Duration {
        Duration::from_millis(self.sleep_gap_threshold_ms)
    }

    pub fn flapping_threshold(&self) -> Duration {
        Duration::from_millis(self.flapping_threshold_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub silence_timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 30_000,
        }
    }
}

impl KeepaliveConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// a batch whose compiled REQ reaches this many filters fires at once
    pub max_filters: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_filters: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_ms: 5 * 60 * 1_000,
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemDisconnectConfig {
    /// disconnects closer together than this count toward a system-wide event
    pub window_ms: u64,
    /// how long a disconnect is remembered at all
    pub retention_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for SystemDisconnectConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            retention_ms: 10_000,
            cooldown_ms: 10_000,
        }
    }
}

impl SystemDisconnectConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
