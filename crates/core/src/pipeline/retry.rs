//! # Retry Policy
//!
//! One retry abstraction for every collaborator call the stage runner makes,
//! parameterized by attempt count, backoff function and retryable-error
//! predicate. Sleeps between attempts race the cancellation token, so a
//! waiting unit never delays cancellation or other units.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::errors::ServiceError;

/// Upper bound for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(&ServiceError) -> bool + Send + Sync>;

/// Why a retried operation gave up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: ServiceError },
    #[error("permanent failure on attempt {attempts}: {error}")]
    Permanent { attempts: u32, error: ServiceError },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffFn,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// `max_attempts` counts every call, the first one included.
    pub fn new(max_attempts: u32, backoff: BackoffFn, retryable: RetryPredicate) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }

    /// `base * 2^(n-1)` after the n-th failure, capped at one minute; retries
    /// whatever [`ServiceError::is_retryable`] accepts.
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self::new(
            max_attempts,
            Arc::new(move |attempt| exponential_delay(base, attempt)),
            Arc::new(ServiceError::is_retryable),
        )
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_predicate(mut self, retryable: RetryPredicate) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep after the given failed attempt. An upstream `retry_after` wins.
    pub fn delay_for(&self, attempt: u32, error: &ServiceError) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| (self.backoff)(attempt))
            .min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// the token is cancelled. `op` receives the 1-based attempt number;
    /// `on_retry` sees each failure that will be retried and the delay before
    /// the next attempt.
    pub async fn run<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        mut on_retry: R,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        R: FnMut(u32, &ServiceError, Duration),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt - 1 });
                }
                result = op(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !(self.retryable)(&error) {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= self.max_attempts {
                tracing::error!(
                    attempts = attempt,
                    error = %error,
                    "Max retries exceeded"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for(attempt, &error);
            tracing::warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, retrying"
            );
            on_retry(attempt, &error, delay);

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}
