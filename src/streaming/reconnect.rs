//! Bounded exponential-backoff reconnection policy

use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// `min(base * 2^attempt, max)`; attempts are counted from 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// What to do after an unexpected close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Ceiling reached; the caller must reconnect explicitly
    GiveUp { attempts: u32 },
    /// Reconnection disabled or the client is disconnecting on purpose
    Stopped,
}

/// Consecutive-failure counter for one client
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
    stopped: bool,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            stopped: false,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The server answered; the link is healthy again
    pub fn on_session_acknowledged(&mut self) {
        if self.attempts > 0 {
            log::debug!("RealtimeClient: reconnect counter reset after {} attempts", self.attempts);
        }
        self.attempts = 0;
    }

    pub fn on_unexpected_close(&mut self) -> ReconnectDecision {
        if self.stopped || !self.policy.enabled {
            return ReconnectDecision::Stopped;
        }
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    /// Deliberate disconnect: exhaust the counter so nothing reschedules
    pub fn stop(&mut self) {
        self.stopped = true;
        self.attempts = self.policy.max_attempts;
    }

    /// Explicit connect after a stop or give-up
    pub fn rearm(&mut self) {
        self.stopped = false;
        self.attempts = 0;
    }
}
