//! Bounded exponential backoff around fallible async operations.

use super::config::RetryConfig;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Backoff parameters for one retried operation
///
/// Attempts run from `0` to `max_retries` inclusive, so an operation is
/// invoked at most `max_retries + 1` times. Deserializes from the
/// millisecond fields of [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RetryConfig")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to sleep after the failed attempt number `attempt` (0-based)
    ///
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`. Results that
    /// overflow or aren't finite clamp to `max_delay`; negative ones to zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        if secs <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(secs)
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
        )
    }
}

/// Identifies the operation being retried in log events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    pub event_type: String,
    pub event_id: String,
    pub operation_name: String,
}

impl RetryContext {
    pub fn new(
        event_type: impl Into<String>,
        event_id: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: event_id.into(),
            operation_name: operation_name.into(),
        }
    }
}

/// Every attempt failed
#[derive(Debug, thiserror::Error)]
#[error("{} failed after {attempts} attempts: {last_error}", .context.operation_name)]
pub struct RetryError<E> {
    /// Total number of invocations, `max_retries + 1`
    pub attempts: u32,
    pub context: RetryContext,
    pub last_error: E,
}

impl<E: std::fmt::Display> From<RetryError<E>> for crate::error::TidehookError {
    fn from(err: RetryError<E>) -> Self {
        crate::error::TidehookError::ExhaustedRetries {
            event_type: err.context.event_type,
            event_id: err.context.event_id,
            attempts: err.attempts,
            message: err.last_error.to_string(),
        }
    }
}

/// Run `operation` until it succeeds or the policy's retry budget is spent
///
/// Every error is treated as retryable. The only suspension point added here
/// is the backoff sleep, which yields to other tasks.
pub async fn execute_with_retry<T, E, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
    context: &RetryContext,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        event_type = %context.event_type,
                        event_id = %context.event_id,
                        operation = %context.operation_name,
                        retries = attempt,
                        "Operation recovered after {} retries",
                        attempt
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= policy.max_retries {
                    tracing::error!(
                        event_type = %context.event_type,
                        event_id = %context.event_id,
                        operation = %context.operation_name,
                        retries = attempt,
                        error = %error,
                        "Operation failed after {} retries, giving up",
                        attempt
                    );
                    return Err(RetryError {
                        attempts: attempt + 1,
                        context: context.clone(),
                        last_error: error,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    event_type = %context.event_type,
                    event_id = %context.event_id,
                    operation = %context.operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry runner carrying a default policy
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry with the executor's policy
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        context: &RetryContext,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        execute_with_retry(operation, &self.policy, context).await
    }

    /// Retry with a one-off policy
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation: F,
        policy: &RetryPolicy,
        context: &RetryContext,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        execute_with_retry(operation, policy, context).await
    }
}
