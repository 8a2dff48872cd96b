//! Restart accounting and backoff calculation
//!
//! Every crash (unexpected exit, readiness timeout, failed health check) is
//! checked against a per-service restart counter. While the counter is below
//! `max_restarts` it is incremented and the next start is delayed by
//! `base * 2^(count-1)`, capped at [`MAX_RESTART_DELAY`]. A crash that finds
//! the counter already at the ceiling is given up on, so `max_restarts = 3`
//! allows three restarts and the fourth crash is terminal.
//!
//! The counter only goes back to zero through [`RestartTracker::reset`],
//! which the supervisor calls after a successful health check. Services
//! without a health check therefore accumulate crashes for their whole life.

use std::time::Duration;
use tracing::debug;

/// Upper bound on the computed backoff delay
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Action to take after a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    /// Restart after `delay`; `attempt` is the 1-based restart number
    Restart {
        /// Restart attempt number
        attempt: u32,
        /// Delay before the restart
        delay: Duration,
    },
    /// The restart ceiling has been reached
    GiveUp {
        /// Restarts performed before giving up
        restarts: u32,
    },
}

/// Per-service crash counter
#[derive(Debug, Clone)]
pub struct RestartTracker {
    max_restarts: u32,
    base_delay: Duration,
    count: u32,
}

impl RestartTracker {
    /// Create a tracker for a service with the given ceiling and base delay
    pub fn new(max_restarts: u32, base_delay: Duration) -> Self {
        Self {
            max_restarts,
            base_delay,
            count: 0,
        }
    }

    /// Record one crash and decide what to do about it
    pub fn record_crash(&mut self) -> RestartAction {
        if self.exhausted() {
            debug!("Crash after {} restarts hit ceiling {}", self.count, self.max_restarts);
            return RestartAction::GiveUp {
                restarts: self.count,
            };
        }
        self.count += 1;
        let delay = backoff_delay(self.base_delay, self.count);
        debug!("Crash {} of {}, restarting in {:?}", self.count, self.max_restarts, delay);
        RestartAction::Restart {
            attempt: self.count,
            delay,
        }
    }

    /// Clear the counter, returning its previous value
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.count)
    }

    /// Restarts scheduled since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the next crash will be given up on
    pub fn exhausted(&self) -> bool {
        self.count >= self.max_restarts
    }
}

/// `base * 2^(count-1)`, capped at [`MAX_RESTART_DELAY`]
pub fn backoff_delay(base: Duration, count: u32) -> Duration {
    let exponent = count.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(MAX_RESTART_DELAY)
        .min(MAX_RESTART_DELAY)
}
