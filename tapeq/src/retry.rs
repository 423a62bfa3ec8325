//! Retry and backoff policy for transient object store failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Exponential backoff settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts made before a transient failure is surfaced.
    pub max_attempts: u16,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

/// Computes the delay before retry number `attempts`.
///
/// Formula: delay = min(base_delay * 2^(attempts - 1), max_backoff)
pub fn compute_backoff_delay(attempts: u16, config: &RetryConfig) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }

    let exp = (attempts.saturating_sub(1)) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}

/// What to do with a job after a failed transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureDecision {
    /// Put the job back in its queue; this mount may still retry it.
    Requeue,
    /// Put the job back in its queue but never offer it to this mount again.
    RequeueElsewhere,
    /// Give up on the job.
    Fail,
}

/// Decide the fate of a job given its failure counters after the failure
/// has been counted.
pub fn decide_after_failure(
    retries_within_mount: u32,
    total_retries: u32,
    max_retries_within_mount: u32,
    max_total_retries: u32,
) -> FailureDecision {
    if total_retries >= max_total_retries {
        FailureDecision::Fail
    } else if retries_within_mount >= max_retries_within_mount {
        FailureDecision::RequeueElsewhere
    } else {
        FailureDecision::Requeue
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts: u16 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                attempts = attempts.saturating_add(1);
                if attempts >= config.max_attempts {
                    return Err(err);
                }
                let delay = compute_backoff_delay(attempts, config);
                tracing::warn!(
                    operation = what,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
