use crate::error::BackendError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// The last error of a call that ran out of attempts or failed permanently.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: BackendError,
}

impl RetryPolicy {
    pub fn with_timeout(self, call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            ..self
        }
    }

    /// Backoff before attempt `attempt + 1`, doubling from `initial_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` with a per-attempt timeout. Transient failures are retried
    /// until `max_attempts`; anything else is returned at once.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match timeout(self.call_timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => BackendError::Timeout(self.call_timeout),
            };

            if !error.is_transient() || attempt >= max_attempts {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                call = label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "backend call failed, retrying"
            );
            sleep(delay).await;
        }
    }
}
