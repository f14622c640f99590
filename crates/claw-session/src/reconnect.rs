//! Reconnection configuration, exponential backoff and the retry timer.

use std::sync::Weak;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::state::Identity;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Number of automatic retries before giving up on an identity.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt + 1`: `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Whether another automatic retry is allowed after `attempts` retries.
    #[must_use]
    pub const fn should_reconnect(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Receiver of fired retry timers.
pub trait RetryTarget: Send + Sync {
    /// The timer identified by `token` fired for `identity`.
    fn retry_due(&self, token: u64, identity: Identity);
}

#[derive(Debug)]
struct PendingRetry {
    token: u64,
    task: JoinHandle<()>,
}

/// Owns the attempt counter and the single pending retry timer.
///
/// The scheduler does not enforce `max_attempts`; the caller checks
/// [`ReconnectConfig::should_reconnect`] before asking for a retry.
#[derive(Debug)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempts: u32,
    pending: Option<PendingRetry>,
    next_token: u64,
}

impl ReconnectScheduler {
    /// Create a scheduler with no pending timer and a zero attempt count.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            pending: None,
            next_token: 1,
        }
    }

    /// Backoff configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Retries scheduled since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Zero the attempt counter.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether the retry budget is used up.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        !self.config.should_reconnect(self.attempts)
    }

    /// Whether a retry timer is armed.
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Arm a one-shot retry for `identity`.
    ///
    /// No-op if a timer is already pending. Otherwise increments the attempt
    /// counter and returns the delay. When the timer fires, `target` receives
    /// the token and identity; it is responsible for calling [`Self::fire`]
    /// and checking the identity is still wanted.
    pub fn schedule(
        &mut self,
        identity: Identity,
        target: Weak<dyn RetryTarget>,
    ) -> Option<Duration> {
        if self.pending.is_some() {
            debug!(identity = %identity, "retry already pending");
            return None;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(identity = %identity, "no async runtime, cannot arm retry timer");
            return None;
        };

        let delay = self.config.delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);

        let token = self.next_token;
        self.next_token += 1;

        let task = runtime.spawn(async move {
            sleep(delay).await;
            if let Some(target) = target.upgrade() {
                target.retry_due(token, identity);
            }
        });
        self.pending = Some(PendingRetry { token, task });

        Some(delay)
    }

    /// Consume the pending timer if `token` matches it.
    ///
    /// Returns `false` for a timer that was cancelled or replaced.
    pub fn fire(&mut self, token: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.token == token => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the pending timer without firing it. Returns whether one existed.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
