//! Per-operation retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use ferry_transfer::TransferError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::transport::TransportError;

/// Retry budget and backoff curve applied to each chunk (and to the initial
/// size lookup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Random spread applied to each delay, as a fraction (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, used where timing is irrelevant.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Calculates the delay after a failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if self.jitter <= 0.0 || capped <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        let with_jitter = (capped + capped * self.jitter * offset).max(0.001);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Why a retried operation stopped without a value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RetryError {
    Cancelled,
    Failed(TransferError),
}

/// Runs `attempt` until it succeeds, fails permanently, exhausts the
/// budget, or `cancel` fires. `attempt` receives the 1-based attempt
/// number.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut n: u32 = 0;
    loop {
        n += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            r = attempt(n) => r,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(TransportError::Retryable(msg)) if n < policy.max_attempts => {
                let delay = policy.delay_for_attempt(n);
                warn!(
                    operation,
                    attempt = n,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "transport error, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(TransportError::Retryable(msg)) => {
                return Err(RetryError::Failed(TransferError::RetryBudgetExhausted {
                    operation: operation.to_string(),
                    attempts: n,
                    last_error: msg,
                }));
            }
            Err(other) => return Err(RetryError::Failed(other.into())),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
