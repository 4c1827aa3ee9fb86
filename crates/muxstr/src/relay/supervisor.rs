use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::config::{KeepaliveConfig, SupervisorConfig};
use crate::relay::keepalive::{Keepalive, KeepaliveAction};
use crate::relay::TransportState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    /// reconnecting too often with too regular connection lifetimes
    Flapping,
    Connected,
    Authenticated,
}

impl RelayStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, RelayStatus::Connected | RelayStatus::Authenticated)
    }
}

const MAX_RECORDED_DURATIONS: usize = 100;

/// Lifetime bookkeeping for one relay, used for flapping detection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub attempts: u32,
    pub successes: u32,
    connected_at: Option<Instant>,
    durations: VecDeque<Duration>,
}

impl ConnectionStats {
    fn attempt(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.connected_at = Some(now);
    }

    fn connected(&mut self, now: Instant) {
        self.successes = self.successes.saturating_add(1);
        self.connected_at = Some(now);
    }

    fn disconnected(&mut self, now: Instant) {
        let Some(since) = self.connected_at.take() else {
            return;
        };

        self.durations.push_back(now.saturating_duration_since(since));
        if self.durations.len() > MAX_RECORDED_DURATIONS {
            self.durations.pop_front();
        }
    }

    pub fn durations(&self) -> impl Iterator<Item = &Duration> {
        self.durations.iter()
    }

    /// Evaluated after every third recorded connection: suspiciously uniform
    /// connection lifetimes mean the relay keeps dropping us on a schedule.
    pub fn is_flapping(&self, threshold: Duration) -> bool {
        let n = self.durations.len();
        if n == 0 || n % 3 != 0 {
            return false;
        }

        let millis: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let mean = millis.iter().sum::<f64>() / n as f64;
        let variance = millis.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n as f64;

        variance.sqrt() < threshold.as_secs_f64() * 1000.0
    }
}

/// Delay before reconnection attempt number `attempt` (starting at 0).
///
/// After a stale connection or a wake from sleep the network is most likely
/// fine again, so a short fixed schedule is used instead of exponential
/// backoff.
pub fn reconnect_delay(attempt: u32, was_idle: bool, config: &SupervisorConfig) -> Duration {
    if was_idle {
        let schedule = &config.idle_schedule_ms;
        let idx = (attempt as usize).min(schedule.len().saturating_sub(1));
        return Duration::from_millis(schedule.get(idx).copied().unwrap_or(0));
    }

    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(
        config
            .backoff_base_ms
            .saturating_mul(factor)
            .min(config.backoff_max_ms),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// the reconnection deadline passed, open a new transport
    Connect,
    /// keepalive probe
    Ping,
    /// the current transport is dead, close and drop it
    DropTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub delay: Duration,
    pub flapping: bool,
}

/// Connection state machine for a single relay.
///
/// Everything is driven by explicit `now` values; the owner polls
/// [`ConnectionSupervisor::poll`] whenever [`ConnectionSupervisor::next_deadline`]
/// passes and performs the returned actions.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    status: RelayStatus,
    attempt: u32,
    was_idle: bool,
    reconnect_at: Option<Instant>,
    last_activity: Option<Instant>,
    next_state_check: Option<Instant>,
    next_sleep_check: Option<Instant>,
    last_sleep_check: Option<SystemTime>,
    keepalive: Keepalive,
    stats: ConnectionStats,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, keepalive: &KeepaliveConfig) -> Self {
        Self {
            config,
            status: RelayStatus::Disconnected,
            attempt: 0,
            was_idle: false,
            reconnect_at: None,
            last_activity: None,
            next_state_check: None,
            next_sleep_check: None,
            last_sleep_check: None,
            keepalive: Keepalive::new(keepalive),
            stats: ConnectionStats::default(),
        }
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn was_idle(&self) -> bool {
        self.was_idle
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn connecting(&mut self, now: Instant) {
        self.status = RelayStatus::Connecting;
        self.reconnect_at = None;
        self.stats.attempt(now);
    }

    pub fn on_open(&mut self, now: Instant, wall: SystemTime) {
        info!("connection established after {} attempts", self.attempt);
        self.status = RelayStatus::Connected;
        self.attempt = 0;
        self.was_idle = false;
        self.reconnect_at = None;
        self.last_activity = Some(now);
        self.stats.connected(now);
        self.keepalive.start(now);
        self.next_state_check = Some(now + self.config.state_check_interval());
        self.next_sleep_check = Some(now + self.config.sleep_check_interval());
        self.last_sleep_check = Some(wall);
    }

    /// Returns true if the status changed.
    pub fn on_authenticated(&mut self) -> bool {
        if self.status != RelayStatus::Connected {
            return false;
        }
        self.status = RelayStatus::Authenticated;
        true
    }

    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.keepalive.record_activity(now);
    }

    pub fn on_disconnect(&mut self, now: Instant) -> Disconnect {
        self.stop_monitoring();
        self.stats.disconnected(now);

        let flapping = self.stats.is_flapping(self.config.flapping_threshold());
        if flapping {
            warn!("relay is flapping after {} attempts", self.stats.attempts);
            self.status = RelayStatus::Flapping;
        } else {
            self.status = RelayStatus::Disconnected;
        }

        let delay = self.schedule_reconnect(now);
        Disconnect { delay, flapping }
    }

    /// Arms the reconnection deadline unless one is already pending.
    pub fn schedule_reconnect(&mut self, now: Instant) -> Duration {
        if let Some(at) = self.reconnect_at {
            return at.saturating_duration_since(now);
        }

        let delay = reconnect_delay(self.attempt, self.was_idle, &self.config);
        debug!(
            "reconnecting in {:?} (attempt {}, idle: {})",
            delay, self.attempt, self.was_idle
        );
        self.reconnect_at = Some(now + delay);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn handle_stale_connection(&mut self, now: Instant) -> Disconnect {
        warn!("stale connection detected");
        self.status = RelayStatus::Disconnected;
        self.was_idle = true;
        self.on_disconnect(now)
    }

    /// Called when the host resumes or the network changes. The next
    /// reconnection uses the fast schedule starting at 0ms.
    pub fn reset_reconnection_state(&mut self) {
        self.was_idle = true;
        self.reconnect_at = None;
        self.attempt = 0;
    }

    fn stop_monitoring(&mut self) {
        self.keepalive.stop();
        self.next_state_check = None;
        self.next_sleep_check = None;
        self.last_sleep_check = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let reconnect = if self.status.is_connected() {
            None
        } else {
            self.reconnect_at
        };

        [
            reconnect,
            self.next_state_check,
            self.next_sleep_check,
            self.keepalive.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every check that is due. Call repeatedly until it returns `None`,
    /// re-reading the transport state after each action.
    pub fn poll(
        &mut self,
        now: Instant,
        wall: SystemTime,
        transport: Option<TransportState>,
    ) -> Option<SupervisorAction> {
        if !self.status.is_connected() {
            if matches!(
                self.status,
                RelayStatus::Disconnected | RelayStatus::Flapping
            ) && self.reconnect_at.is_some_and(|at| at <= now)
            {
                self.reconnect_at = None;
                return Some(SupervisorAction::Connect);
            }
            return None;
        }

        // Only catches sockets whose transport noticed the drop. The ewebsock
        // transport learns its state from received events, so a socket that
        // dies silently still reads as open and is left to the keepalive.
        if self.next_state_check.is_some_and(|at| at <= now) {
            self.next_state_check = Some(now + self.config.state_check_interval());
            if transport != Some(TransportState::Open) {
                self.handle_stale_connection(now);
                return Some(SupervisorAction::DropTransport);
            }
        }

        if self.next_sleep_check.is_some_and(|at| at <= now) {
            self.next_sleep_check = Some(now + self.config.sleep_check_interval());
            let gap = self
                .last_sleep_check
                .and_then(|last| wall.duration_since(last).ok())
                .unwrap_or_default();
            self.last_sleep_check = Some(wall);

            if gap > self.config.sleep_gap_threshold() {
                info!("possible wake from sleep, clock jumped {:?}", gap);
                self.was_idle = true;
                if transport != Some(TransportState::Open) {
                    self.handle_stale_connection(now);
                    return Some(SupervisorAction::DropTransport);
                }
            }
        }

        match self.keepalive.poll(now) {
            Some(KeepaliveAction::Ping) => Some(SupervisorAction::Ping),
            Some(KeepaliveAction::Dead) => {
                self.handle_stale_connection(now);
                Some(SupervisorAction::DropTransport)
            }
            None => None,
        }
    }
}
