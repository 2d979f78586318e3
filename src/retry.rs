//! Rate-limit retry policy.
//!
//! Remote collaborators signal a rate limit together with the exact wait they
//! require. Every call site that talks to them goes through
//! [`retry_rate_limited`] with a [`RetryPolicy`] instead of sleeping and
//! re-invoking itself:
//!
//! - Notifier: [`RetryPolicy::ONCE`], one retry after the signaled wait
//! - Scan Orchestrator: [`RetryPolicy::UNBOUNDED`], rate limits are routine
//!
//! The wait is never shortened or grown: a retry happens exactly when the
//! collaborator said it may. Errors that are not rate limits are returned
//! immediately. Waiting is the only sanctioned sleep in the system, so it
//! always races the shutdown token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that may carry a rate-limit signal.
pub trait RateLimitSignal {
    /// The wait the collaborator requires, if this is a rate limit.
    fn rate_limit_wait(&self) -> Option<Duration>;
}

/// How many rate-limit retries a call site is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt. `None` is unbounded.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Never retry.
    pub const NONE: Self = Self {
        max_retries: Some(0),
    };

    /// Retry once after the signaled wait.
    pub const ONCE: Self = Self {
        max_retries: Some(1),
    };

    /// Retry every rate limit, each after its signaled wait.
    pub const UNBOUNDED: Self = Self { max_retries: None };

    /// Whether another retry is allowed after `retries` retries so far.
    pub fn allows(&self, retries: u32) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Success(T),

    /// Still rate limited after the policy's last retry.
    ExhaustedRetries {
        last_error: E,
        /// Attempts made, including the initial one.
        attempts: u32,
    },

    /// A non-rate-limit error; never retried.
    Failed(E),

    /// Shutdown was requested during a wait.
    Cancelled,
}

impl<T, E> RetryResult<T, E> {
    /// Converts to a `Result`, mapping cancellation to `None`.
    pub fn into_result(self) -> Option<Result<T, E>> {
        match self {
            RetryResult::Success(v) => Some(Ok(v)),
            RetryResult::ExhaustedRetries { last_error, .. } => Some(Err(last_error)),
            RetryResult::Failed(e) => Some(Err(e)),
            RetryResult::Cancelled => None,
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `false` if cancelled.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Executes an async operation, retrying rate limits per `policy`.
///
/// `label` names the operation in logs.
pub async fn retry_rate_limited<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> RetryResult<T, E>
where
    E: RateLimitSignal + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0;

    loop {
        if cancel.is_cancelled() {
            return RetryResult::Cancelled;
        }

        let e = match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => e,
        };

        let Some(wait) = e.rate_limit_wait() else {
            return RetryResult::Failed(e);
        };

        if !policy.allows(retries) {
            return RetryResult::ExhaustedRetries {
                last_error: e,
                attempts: retries + 1,
            };
        }

        warn!(
            operation = label,
            wait_ms = wait.as_millis() as u64,
            retry = retries + 1,
            "Rate limited, waiting before retry"
        );

        if !sleep_cancellable(wait, cancel).await {
            return RetryResult::Cancelled;
        }
        retries += 1;
    }
}
