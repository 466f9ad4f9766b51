//! Retry policy engine
//!
//! Decides, for a failed attempt, whether and when the state machine may try
//! again. Decisions are ephemeral values, consumed immediately; nothing here
//! is persisted.

use std::time::Duration;

use rand::Rng;

use crate::error::FailureKind;

/// Backoff configuration shared by all steps of an engine.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied to the exponential curve.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay, spreading out
    /// retries of concurrently running workflows.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// Near-zero delays for deterministic, fast tests.
    pub fn testing() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: Duration::ZERO,
        }
    }
}

/// Outcome of consulting the policy for one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
    pub reason: String,
}

impl RetryDecision {
    fn denied(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }

    fn granted(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            delay,
            reason: reason.into(),
        }
    }
}

/// Stateless policy: classification and attempt count in, decision out.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide the fate of a step whose `attempt`-th try (1-based) just
    /// failed with `failure`. `max_retries` is the number of additional
    /// attempts allowed beyond the first.
    pub fn decide(&self, max_retries: u32, attempt: u32, failure: FailureKind) -> RetryDecision {
        if !failure.is_retryable() {
            return RetryDecision::denied(format!("{failure} failures are never retried"));
        }

        if attempt > max_retries {
            return RetryDecision::denied(format!(
                "retries exhausted after {attempt} attempts ({failure})"
            ));
        }

        let delay = self.backoff(attempt) + self.sample_jitter();
        RetryDecision::granted(
            delay,
            format!("attempt {attempt} failed with {failure}; retrying"),
        )
    }

    /// Exponential backoff before jitter: `base * 2^(attempt-1)`, capped.
    /// Monotonically non-decreasing in the attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis();
        let cap_ms = self.config.max_delay.as_millis();
        let shifted = base_ms.saturating_mul(1u128 << attempt.saturating_sub(1).min(32));
        Duration::from_millis(shifted.min(cap_ms) as u64)
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
