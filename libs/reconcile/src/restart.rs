//! Crash restart policy.
//!
//! Decides whether a crashed instance may be placed again, either inline
//! with the crash or later during convergence.

use std::fmt;
use std::time::Duration;

use crate::ReconcileError;

/// Strategy deciding when crashed instances restart.
pub trait RestartPolicy: Send + Sync + fmt::Debug {
    /// How long an instance must have been running for a crash to reset
    /// its crash count.
    fn crash_reset_timeout(&self) -> Duration;

    /// Whether an instance with `crash_count` crashes may restart once
    /// `elapsed` has passed since its last crash.
    fn should_restart(&self, crash_count: u32, elapsed: Duration) -> bool;

    /// Whether the crash should be followed by an immediate restart.
    fn should_restart_immediately(&self, crash_count: u32) -> bool {
        self.should_restart(crash_count, Duration::ZERO)
    }

    /// Crash count after a new crash.
    ///
    /// `running_for` is how long the instance had been in its current state;
    /// it only matters if that state was Running.
    fn next_crash_count(&self, prior: u32, was_running: bool, running_for: Duration) -> u32 {
        if was_running && running_for > self.crash_reset_timeout() {
            1
        } else {
            prior.saturating_add(1)
        }
    }
}

/// Immediate restarts, then exponential backoff, then give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffRestartPolicy {
    /// Crashes restarted without delay.
    pub immediate_restarts: u32,
    /// Backoff before the first delayed restart.
    pub min_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Once the crash count exceeds this, the instance stays crashed.
    pub max_restart_attempts: u32,
    pub crash_reset_timeout: Duration,
}

impl Default for BackoffRestartPolicy {
    fn default() -> Self {
        Self {
            immediate_restarts: 3,
            min_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(16 * 60),
            max_restart_attempts: 200,
            crash_reset_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffRestartPolicy {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.min_backoff.is_zero() {
            return Err(ReconcileError::InvalidPolicy(
                "min backoff must be positive".to_string(),
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(ReconcileError::InvalidPolicy(format!(
                "min backoff {:?} exceeds max backoff {:?}",
                self.min_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// Delay required before restarting after `crash_count` crashes, or
    /// `None` if the restart is immediate.
    pub fn backoff(&self, crash_count: u32) -> Option<Duration> {
        if crash_count <= self.immediate_restarts {
            return None;
        }
        // 30s * 2^6 already passes any sane ceiling.
        let exponent = (crash_count - self.immediate_restarts).min(16);
        let delay = self
            .min_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff);
        Some(delay.min(self.max_backoff))
    }
}

impl RestartPolicy for BackoffRestartPolicy {
    fn crash_reset_timeout(&self) -> Duration {
        self.crash_reset_timeout
    }

    fn should_restart(&self, crash_count: u32, elapsed: Duration) -> bool {
        if crash_count > self.max_restart_attempts {
            return false;
        }
        match self.backoff(crash_count) {
            None => true,
            Some(delay) => elapsed >= delay,
        }
    }
}
