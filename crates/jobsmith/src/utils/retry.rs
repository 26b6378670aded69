//! Retry with exponential backoff and symmetric jitter
//!
//! One algorithm serves every caller: ad-hoc jobs, scheduled jobs and internal
//! backend operations all go through [`execute_with_retry`].

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::defaults::{DEFAULT_JITTER_FACTOR, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY};
use crate::config::duration_serde;
use crate::errors::{JobError, QueueError, QueueResult};
use crate::utils::jitter::{jittered, unit_sample};

/// Retry behaviour for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each subsequent one
    #[serde(with = "duration_serde::duration", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Spread applied to each delay, in `[0, 1]`
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Error kinds that trigger a retry; empty means every kind
    #[serde(default)]
    pub retry_on: Vec<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    duration_serde::parse_default(DEFAULT_RETRY_BASE_DELAY)
}

fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            jitter_factor: default_jitter_factor(),
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter_factor,
            retry_on: Vec::new(),
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, 0.0)
    }

    /// Restrict retries to the given error kinds
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a run-function error of this kind should be retried
    pub fn is_retryable(&self, error: &JobError) -> bool {
        self.retry_on.is_empty() || self.retry_on.iter().any(|kind| *kind == error.kind)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(QueueError::configuration(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), with a fresh jitter sample
    pub fn delay_for(&self, attempt: u32) -> Duration {
        compute_delay(self.base_delay, attempt, self.jitter_factor, unit_sample())
    }
}

/// Delay before the retry following failed attempt `attempt` (1-based)
///
/// `base_delay * 2^(attempt-1)`, then symmetric jitter using `sample` in `[-1, 1]`.
pub fn compute_delay(base_delay: Duration, attempt: u32, jitter_factor: f64, sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let nominal = base_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    jittered(nominal, jitter_factor, sample)
}

/// Run `run` until it succeeds, the error is not retryable, or retries are exhausted
///
/// # Arguments
///
/// * `name` - Human-readable operation name for logging
/// * `policy` - Retry count, base delay and jitter
/// * `run` - Async closure invoked once per attempt, receiving the 1-based attempt number
/// * `retryable` - Classifies an error as worth retrying
///
/// # Returns
///
/// The first success, or the last error unchanged
pub async fn execute_with_retry<T, E, F, Fut, R>(
    name: &str,
    policy: &RetryPolicy,
    mut run: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 1;
    loop {
        match run(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Operation '{}' succeeded on attempt {}", name, attempt);
                }
                return Ok(value);
            }
            Err(err) => {
                if !retryable(&err) {
                    error!(
                        "Operation '{}' failed with non-retryable error after {} attempt(s): {}",
                        name, attempt, err
                    );
                    return Err(err);
                }
                if attempt > policy.max_retries {
                    error!("Operation '{}' failed after {} attempts: {}", name, attempt, err);
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                    name,
                    attempt,
                    policy.max_retries + 1,
                    delay,
                    err
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
