//! Failure classification: mapping errors to retry decisions

use std::fmt;
use std::io;

use crate::errors::{Error, PoolError, ServiceError, ServiceErrorKind, StatusCode, TransportCode};

/// Whether a failed operation is known to have completed on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// The operation definitely finished; repeating it is never safe
    Finished,
    /// The operation definitely did not take effect; always safe to repeat
    Retryable,
    /// Outcome unknown; repeat only idempotent operations
    Undefined,
}

/// Delay class applied before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffType {
    None,
    Fast,
    Slow,
}

/// Retry decision derived from a single error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMode {
    status_code: i64,
    operation_status: OperationStatus,
    backoff: BackoffType,
    invalidate: bool,
}

impl RetryMode {
    pub const fn new(
        status_code: i64,
        operation_status: OperationStatus,
        backoff: BackoffType,
        invalidate: bool,
    ) -> Self {
        Self {
            status_code,
            operation_status,
            backoff,
            invalidate,
        }
    }

    /// Never retry
    pub const fn finished(status_code: i64) -> Self {
        Self::new(status_code, OperationStatus::Finished, BackoffType::None, false)
    }

    /// Always retry
    pub const fn retryable(status_code: i64, backoff: BackoffType, invalidate: bool) -> Self {
        Self::new(status_code, OperationStatus::Retryable, backoff, invalidate)
    }

    /// Retry only when the caller declared the operation idempotent
    pub const fn undefined(status_code: i64, backoff: BackoffType, invalidate: bool) -> Self {
        Self::new(status_code, OperationStatus::Undefined, backoff, invalidate)
    }

    pub fn status_code(&self) -> i64 {
        self.status_code
    }

    pub fn operation_status(&self) -> OperationStatus {
        self.operation_status
    }

    pub fn backoff(&self) -> BackoffType {
        self.backoff
    }

    pub fn must_backoff(&self) -> bool {
        self.backoff != BackoffType::None
    }

    /// Whether the item the operation ran against has to be discarded
    pub fn must_invalidate(&self) -> bool {
        self.invalidate
    }

    pub fn must_retry(&self, idempotent: bool) -> bool {
        match self.operation_status {
            OperationStatus::Finished => false,
            OperationStatus::Retryable => true,
            OperationStatus::Undefined => idempotent,
        }
    }
}

/// Errors that know how the retry engine should treat them
pub trait Classify {
    fn retry_mode(&self) -> RetryMode;
}

impl<T: Classify + ?Sized> Classify for &T {
    fn retry_mode(&self) -> RetryMode {
        (**self).retry_mode()
    }
}

impl Classify for PoolError {
    fn retry_mode(&self) -> RetryMode {
        match self {
            PoolError::Overflow => RetryMode::retryable(-1, BackoffType::Fast, false),
            PoolError::Closed => RetryMode::finished(-2),
            PoolError::ItemNotAlive => RetryMode::retryable(-3, BackoffType::None, true),
            PoolError::NoProgress => RetryMode::retryable(-4, BackoffType::Fast, false),
            PoolError::CreateTimeout(_) => RetryMode::retryable(-5, BackoffType::Fast, false),
            PoolError::Cancelled => RetryMode::finished(-6),
            PoolError::Exhausted { .. } => RetryMode::retryable(-7, BackoffType::Slow, false),
        }
    }
}

impl<E: Classify> Classify for Error<E> {
    fn retry_mode(&self) -> RetryMode {
        match self {
            Error::Pool(err) => err.retry_mode(),
            Error::Create(err) => {
                // Creating an item never touched user data, so an undetermined
                // outcome is safe to repeat.
                let mode = err.retry_mode();
                match mode.operation_status {
                    OperationStatus::Finished => mode,
                    _ => RetryMode {
                        operation_status: OperationStatus::Retryable,
                        backoff: match mode.backoff {
                            BackoffType::None => BackoffType::Fast,
                            other => other,
                        },
                        ..mode
                    },
                }
            }
            Error::Operation(err) => err.retry_mode(),
        }
    }
}

impl Classify for ServiceError {
    fn retry_mode(&self) -> RetryMode {
        match self.kind() {
            ServiceErrorKind::Operation(status) => {
                let code = status.code();
                match status {
                    StatusCode::Aborted => RetryMode::retryable(code, BackoffType::None, false),
                    StatusCode::Unavailable => RetryMode::retryable(code, BackoffType::Fast, false),
                    StatusCode::Overloaded => RetryMode::retryable(code, BackoffType::Slow, false),
                    StatusCode::BadSession | StatusCode::SessionExpired => {
                        RetryMode::retryable(code, BackoffType::None, true)
                    }
                    StatusCode::SessionBusy => RetryMode::retryable(code, BackoffType::Fast, true),
                    StatusCode::Undetermined | StatusCode::Timeout | StatusCode::Cancelled => {
                        RetryMode::undefined(code, BackoffType::Fast, false)
                    }
                    _ => RetryMode::finished(code),
                }
            }
            ServiceErrorKind::Transport(transport) => {
                let code = transport.code();
                match transport {
                    TransportCode::ResourceExhausted => {
                        RetryMode::retryable(code, BackoffType::Slow, false)
                    }
                    TransportCode::Aborted => RetryMode::retryable(code, BackoffType::None, false),
                    TransportCode::Unavailable
                    | TransportCode::Internal
                    | TransportCode::Canceled
                    | TransportCode::DeadlineExceeded
                    | TransportCode::Unknown => RetryMode::undefined(code, BackoffType::Fast, true),
                    _ => RetryMode::finished(code),
                }
            }
        }
    }
}

impl Classify for io::Error {
    fn retry_mode(&self) -> RetryMode {
        // io errors share one code per kind family so escalation tracks them
        match self.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => RetryMode::retryable(-100, BackoffType::Fast, true),
            io::ErrorKind::TimedOut => RetryMode::undefined(-101, BackoffType::Fast, true),
            io::ErrorKind::Interrupted => RetryMode::retryable(-102, BackoffType::None, false),
            _ => RetryMode::finished(-103),
        }
    }
}

/// Marks an arbitrary error as safe to retry
///
/// # Examples
///
/// ```
/// use sessionpool::{BackoffType, Classify, Retryable};
///
/// let err = Retryable::new(std::fmt::Error).with_backoff(BackoffType::Slow);
/// assert!(err.retry_mode().must_retry(false));
/// assert_eq!(err.retry_mode().backoff(), BackoffType::Slow);
/// ```
#[derive(Debug, Clone)]
pub struct Retryable<E> {
    source: E,
    backoff: BackoffType,
    invalidate: bool,
}

impl<E> Retryable<E> {
    pub fn new(source: E) -> Self {
        Self {
            source,
            backoff: BackoffType::Fast,
            invalidate: false,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffType) -> Self {
        self.backoff = backoff;
        self
    }

    /// Discard the item the operation ran against before retrying
    pub fn with_invalidate(mut self) -> Self {
        self.invalidate = true;
        self
    }

    pub fn into_inner(self) -> E {
        self.source
    }
}

impl<E: fmt::Display> fmt::Display for Retryable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retryable error: {}", self.source)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Retryable<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl<E> Classify for Retryable<E> {
    fn retry_mode(&self) -> RetryMode {
        RetryMode::new(-1000, OperationStatus::Retryable, self.backoff, self.invalidate)
    }
}
