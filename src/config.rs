//! Engine limits and configuration profiles

use std::time::Duration;

use crate::retry::RetryConfig;

/// Engine-wide limits applied to every run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryConfig,

    /// Timeout for steps that do not set their own.
    pub default_step_timeout: Duration,

    /// Retry budget for steps that do not set their own.
    pub default_max_retries: u32,

    /// Maximum serialized size of a single step's result payload.
    pub max_payload_size: usize,

    /// Maximum wall-clock time for an entire run.
    pub max_run_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_step_timeout: Duration::from_secs(30),
            default_max_retries: 2,
            max_payload_size: 10 * 1024 * 1024, // 10 MB
            max_run_duration: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Tight limits and near-zero backoff for tests.
    pub fn testing() -> Self {
        Self {
            retry: RetryConfig::testing(),
            default_step_timeout: Duration::from_secs(5),
            default_max_retries: 1,
            max_payload_size: 1024 * 1024,
            max_run_duration: Duration::from_secs(60),
        }
    }
}
