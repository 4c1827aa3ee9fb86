use std::time::{Duration, Instant};

use crate::config::KeepaliveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// the relay has been silent for a while, probe it
    Ping,
    /// the probe went unanswered as well
    Dead,
}

/// Activity based keepalive. Any inbound frame counts as a sign of life;
/// after `silence_timeout` without one a ping is due, and after another
/// `silence_timeout` the connection is considered dead.
#[derive(Debug, Clone)]
pub struct Keepalive {
    silence_timeout: Duration,
    last_activity: Option<Instant>,
    probe_sent_at: Option<Instant>,
}

impl Keepalive {
    pub fn new(config: &KeepaliveConfig) -> Self {
        Self {
            silence_timeout: config.silence_timeout(),
            last_activity: None,
            probe_sent_at: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.probe_sent_at = None;
    }

    pub fn stop(&mut self) {
        self.last_activity = None;
        self.probe_sent_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.last_activity.is_some()
    }

    pub fn record_activity(&mut self, now: Instant) {
        if self.last_activity.is_some() {
            self.last_activity = Some(now);
            self.probe_sent_at = None;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let last = self.last_activity?;
        Some(self.probe_sent_at.unwrap_or(last) + self.silence_timeout)
    }

    pub fn poll(&mut self, now: Instant) -> Option<KeepaliveAction> {
        let deadline = self.next_deadline()?;
        if now < deadline {
            return None;
        }

        if self.probe_sent_at.is_some() {
            self.stop();
            return Some(KeepaliveAction::Dead);
        }

        self.probe_sent_at = Some(now);
        Some(KeepaliveAction::Ping)
    }
}
