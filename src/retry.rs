//! Retry loop driven by error classification

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, LogBackoff};
use crate::classify::{BackoffType, Classify, RetryMode};
use crate::errors::{PoolError, RetryError};
use crate::trace::{NoopTrace, RetryTrace};

/// Settings for one retry loop
///
/// # Examples
///
/// ```
/// use sessionpool::{LogBackoff, RetryOptions};
/// use std::time::Duration;
///
/// let options = RetryOptions::new()
///     .with_id("load-profile")
///     .with_idempotent(true)
///     .with_fast_backoff(LogBackoff::new(Duration::from_millis(1), 4, 0.5));
///
/// assert!(options.idempotent());
/// assert_eq!(options.id(), "load-profile");
/// ```
#[derive(Clone)]
pub struct RetryOptions {
    id: String,
    idempotent: bool,
    fast_backoff: Arc<dyn Backoff>,
    slow_backoff: Arc<dyn Backoff>,
    trace: Arc<dyn RetryTrace>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            idempotent: false,
            fast_backoff: Arc::new(LogBackoff::fast()),
            slow_backoff: Arc::new(LogBackoff::slow()),
            trace: Arc::new(NoopTrace),
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("id", &self.id)
            .field("idempotent", &self.idempotent)
            .field("fast_backoff", &self.fast_backoff)
            .field("slow_backoff", &self.slow_backoff)
            .finish_non_exhaustive()
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlation id reported to the trace
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Allow retrying errors whose outcome is undetermined
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_fast_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.fast_backoff = Arc::new(backoff);
        self
    }

    pub fn with_slow_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.slow_backoff = Arc::new(backoff);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn RetryTrace>) -> Self {
        self.trace = trace;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn idempotent(&self) -> bool {
        self.idempotent
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `token` is cancelled.
///
/// Escalation of the backoff delay continues only while the same status
/// code keeps repeating; a different failure starts over from index 0.
/// Cancellation during a backoff wait returns the error that caused it.
///
/// # Examples
///
/// ```
/// use sessionpool::{retry, RetryOptions, ServiceError, StatusCode};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let token = CancellationToken::new();
/// let mut calls = 0;
/// let result = retry(&token, &RetryOptions::new(), || {
///     calls += 1;
///     let failed = calls < 3;
///     async move {
///         if failed {
///             Err(ServiceError::operation(StatusCode::Aborted, "tx lock invalidated"))
///         } else {
///             Ok(calls)
///         }
///     }
/// })
/// .await;
///
/// assert_eq!(result.unwrap(), 3);
/// # }
/// ```
pub async fn retry<R, E, F, Fut>(
    token: &CancellationToken,
    options: &RetryOptions,
    mut op: F,
) -> Result<R, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Classify + fmt::Display,
{
    let trace = &options.trace;
    trace.on_retry_start(&options.id, options.idempotent);

    let mut attempts = 0usize;
    let mut i = 0usize;
    let mut code: Option<i64> = None;

    loop {
        if token.is_cancelled() {
            let err = RetryError::Cancelled { attempts };
            trace.on_retry_done(&options.id, attempts, Some(&err));
            return Err(err);
        }

        attempts += 1;
        let err = match op().await {
            Ok(value) => {
                trace.on_retry_done(&options.id, attempts, None);
                return Ok(value);
            }
            Err(err) => err,
        };

        let mode = err.retry_mode();
        if code != Some(mode.status_code()) {
            i = 0;
        }

        if !mode.must_retry(options.idempotent) {
            tracing::debug!(
                id = %options.id,
                attempts,
                status_code = mode.status_code(),
                "operation failed with non-retryable error"
            );
            trace.on_retry_done(&options.id, attempts, Some(&err));
            return Err(RetryError::Failed { attempts, source: err });
        }

        tracing::trace!(
            id = %options.id,
            attempt = attempts,
            status_code = mode.status_code(),
            backoff = ?mode.backoff(),
            "retrying operation"
        );

        if wait(token, options, &mode, i).await.is_err() {
            trace.on_retry_done(&options.id, attempts, Some(&err));
            return Err(RetryError::Failed { attempts, source: err });
        }

        code = Some(mode.status_code());
        i += 1;
        trace.on_retry_intermediate(&options.id, attempts, &err);
    }
}

/// Sleeps for the backoff class of `mode` at index `i`
///
/// Fails with [`PoolError::Cancelled`] if `token` fires first.
pub async fn wait(
    token: &CancellationToken,
    options: &RetryOptions,
    mode: &RetryMode,
    i: usize,
) -> Result<(), PoolError> {
    let backoff = match mode.backoff() {
        // Immediate retries still give the canceller a chance to run
        BackoffType::None => {
            return tokio::select! {
                biased;
                _ = token.cancelled() => Err(PoolError::Cancelled),
                _ = tokio::task::yield_now() => Ok(()),
            };
        }
        BackoffType::Fast => &options.fast_backoff,
        BackoffType::Slow => &options.slow_backoff,
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(PoolError::Cancelled),
        _ = backoff.wait(i) => Ok(()),
    }
}
