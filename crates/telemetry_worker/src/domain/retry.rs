use crate::domain::TimeBudget;
use common::domain::{classify_sink_error, ProcessingError, SinkError, SinkResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Bounded retry for sink calls, shared by both sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): doubles from `base_delay`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds or `max_attempts` is used up.
    ///
    /// Every kind of failure is retried; only `budget` can end the loop
    /// early, and no attempt outlives its deadline. The classification of
    /// the last attempt is returned.
    pub async fn execute<F, Fut>(
        &self,
        operation_name: &str,
        budget: &TimeBudget,
        mut operation: F,
    ) -> Result<(), ProcessingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SinkResult<()>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let timeout = budget.attempt_timeout(self.request_timeout);
            let result = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout(timeout)),
            };

            let failure = match result {
                Ok(()) => {
                    debug!(operation = operation_name, attempt, "sink call succeeded");
                    return Ok(());
                }
                Err(e) => classify_sink_error(&e),
            };

            if attempt >= max_attempts {
                error!(
                    operation = operation_name,
                    attempts = attempt,
                    error_kind = %failure.kind,
                    error = %failure.message,
                    "sink call failed, retries exhausted"
                );
                return Err(failure.with_context("attempts", attempt.to_string()));
            }

            let delay = self.backoff(attempt);
            if !budget.allows(delay) {
                warn!(
                    operation = operation_name,
                    attempt,
                    error_kind = %failure.kind,
                    error = %failure.message,
                    "not enough time left for another attempt"
                );
                return Err(failure.with_context("attempts", attempt.to_string()));
            }

            warn!(
                operation = operation_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error_kind = %failure.kind,
                error = %failure.message,
                "sink call failed, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
