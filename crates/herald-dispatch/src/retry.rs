//! Bounded retry with a fixed delay schedule.
//!
//! A [`RetryPolicy`] describes how many attempts to make and how long to wait
//! between them. A [`RetryExecutor`] pairs a policy with a [`Clock`] and runs
//! an operation until it succeeds or the attempts are used up.

use std::{future::Future, sync::Arc, time::Duration};

use herald_core::Clock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, Result};

/// Retry policy for delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_retries: u32,

    /// Delay after each failed attempt. The last entry is reused when there
    /// are more attempts than delays.
    pub delays: Vec<Duration>,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(15)],
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the attempt with the given zero-based index fails.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let index = usize::try_from(attempt_index).unwrap_or(usize::MAX);
        let base = self
            .delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO);

        apply_jitter(base, self.jitter_factor)
    }

    /// Number of attempts the executor will actually make.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Runs operations under a [`RetryPolicy`], sleeping on the injected clock.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    /// Creates an executor for `policy`.
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    /// Policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `op` with the zero-based attempt index until it succeeds or the
    /// policy is exhausted.
    ///
    /// Every error triggers another attempt. No delay follows the final
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt once all attempts have failed.
    pub async fn execute_with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.resume_with_retry(label, 0, op).await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), but starts at
    /// `first_attempt` so a resumed operation only gets the attempts and
    /// delays that remain. At least one attempt is always made.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt once all attempts have failed.
    pub async fn resume_with_retry<T, F, Fut>(
        &self,
        label: &str,
        first_attempt: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.attempts();
        let mut attempt = first_attempt;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 >= attempts => {
                    tracing::warn!(
                        operation = label,
                        attempts,
                        error = %error,
                        error_category = %ErrorCategory::from(&error),
                        "retries exhausted"
                    );
                    return Err(error);
                },
                Err(error) => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(
                        operation = label,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "attempt failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

/// Randomizes a delay by up to ±`jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
