//! Retry with configurable backoff for generation calls.
//!
//! Lives in the adapter layer: retry is an adapter-internal concern, and a
//! surfaced error means the budget is already exhausted.

use std::time::Duration;

use loomgen_types::{LoomError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Call `f` up to `max_attempts` times, sleeping per `policy` between
/// attempts. Only errors satisfying [`LoomError::is_retryable`] are retried;
/// anything else surfaces immediately. The last attempt's error is returned
/// as-is when the budget runs out.
pub async fn call_with_retry<T, F, Fut>(
    f: F,
    max_attempts: usize,
    policy: &BackoffPolicy,
    provider: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    provider = %provider,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable generation error, retrying"
                );
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| LoomError::RetriesExhausted {
        provider: provider.to_string(),
        attempts: max_attempts,
    }))
}
