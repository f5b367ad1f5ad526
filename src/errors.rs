//! Error types for the session pool and the retry engine

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::classify::{Classify, OperationStatus};

/// Boxed error returned by [`Item::close`](crate::Item::close)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised by the pool itself
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("pool is overflowed - no idle item and no free admission slot")]
    Overflow,

    #[error("pool is closed")]
    Closed,

    #[error("item is not alive")]
    ItemNotAlive,

    #[error("item creation made no progress")]
    NoProgress,

    #[error("item creation timed out after {0:?}")]
    CreateTimeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,

    #[error(
        "failed to get item from pool (attempts: {attempts}, latency: {elapsed:?}, \
         pool has {index} items ({busy} busy, {idle} idle, \
         {create_in_progress} create_in_progress)): {last_error}"
    )]
    Exhausted {
        attempts: usize,
        elapsed: Duration,
        index: usize,
        busy: usize,
        idle: usize,
        create_in_progress: usize,
        last_error: String,
    },
}

impl PoolError {
    /// Whether the acquisition loop may try again after this error
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::Overflow | PoolError::NoProgress | PoolError::CreateTimeout(_)
        )
    }
}

/// Error produced by acquiring an item or running work against it
#[derive(Error, Debug)]
pub enum Error<E> {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to create item: {0}")]
    Create(#[source] E),

    #[error(transparent)]
    Operation(E),
}

impl<E> Error<E> {
    /// The pool error, if this is one
    pub fn as_pool_error(&self) -> Option<&PoolError> {
        match self {
            Error::Pool(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: Classify> Error<E> {
    /// Whether an acquisition attempt should fall back to the wait queue
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Error::Pool(err) => err.is_transient(),
            Error::Create(err) => err.retry_mode().operation_status() == OperationStatus::Retryable,
            Error::Operation(_) => false,
        }
    }
}

/// Outcome of a [`retry`](crate::retry()) loop that did not succeed
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("retry cancelled after {attempts} attempts")]
    Cancelled { attempts: usize },

    #[error("operation failed after {attempts} attempts: {source}")]
    Failed {
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Cancelled { attempts } | RetryError::Failed { attempts, .. } => *attempts,
        }
    }

    /// The last operation error, if the loop stopped on one
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::Failed { source, .. } => Some(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Status of a finished remote operation, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    BadRequest,
    Unauthorized,
    InternalError,
    Aborted,
    Unavailable,
    Overloaded,
    SchemeError,
    GenericError,
    Timeout,
    BadSession,
    PreconditionFailed,
    AlreadyExists,
    NotFound,
    SessionExpired,
    Cancelled,
    Undetermined,
    Unsupported,
    SessionBusy,
}

impl StatusCode {
    /// Numeric wire value of the status
    pub fn code(self) -> i64 {
        match self {
            StatusCode::BadRequest => 400010,
            StatusCode::Unauthorized => 400020,
            StatusCode::InternalError => 400030,
            StatusCode::Aborted => 400040,
            StatusCode::Unavailable => 400050,
            StatusCode::Overloaded => 400060,
            StatusCode::SchemeError => 400070,
            StatusCode::GenericError => 400080,
            StatusCode::Timeout => 400090,
            StatusCode::BadSession => 400100,
            StatusCode::PreconditionFailed => 400120,
            StatusCode::AlreadyExists => 400130,
            StatusCode::NotFound => 400140,
            StatusCode::SessionExpired => 400150,
            StatusCode::Cancelled => 400160,
            StatusCode::Undetermined => 400170,
            StatusCode::Unsupported => 400180,
            StatusCode::SessionBusy => 400190,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::Unauthorized => "UNAUTHORIZED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Overloaded => "OVERLOADED",
            StatusCode::SchemeError => "SCHEME_ERROR",
            StatusCode::GenericError => "GENERIC_ERROR",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::BadSession => "BAD_SESSION",
            StatusCode::PreconditionFailed => "PRECONDITION_FAILED",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::SessionExpired => "SESSION_EXPIRED",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Undetermined => "UNDETERMINED",
            StatusCode::Unsupported => "UNSUPPORTED",
            StatusCode::SessionBusy => "SESSION_BUSY",
        };
        write!(f, "{}/{}", name, self.code())
    }
}

/// Transport-level failure codes (gRPC numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportCode {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl TransportCode {
    pub fn code(self) -> i64 {
        match self {
            TransportCode::Canceled => 1,
            TransportCode::Unknown => 2,
            TransportCode::InvalidArgument => 3,
            TransportCode::DeadlineExceeded => 4,
            TransportCode::NotFound => 5,
            TransportCode::AlreadyExists => 6,
            TransportCode::PermissionDenied => 7,
            TransportCode::ResourceExhausted => 8,
            TransportCode::FailedPrecondition => 9,
            TransportCode::Aborted => 10,
            TransportCode::OutOfRange => 11,
            TransportCode::Unimplemented => 12,
            TransportCode::Internal => 13,
            TransportCode::Unavailable => 14,
            TransportCode::DataLoss => 15,
            TransportCode::Unauthenticated => 16,
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport/{:?}/{}", self, self.code())
    }
}

/// Where a [`ServiceError`] originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The backend executed the request and answered with a failure status
    Operation(StatusCode),
    /// The request did not get a definitive answer from the backend
    Transport(TransportCode),
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceErrorKind::Operation(status) => write!(f, "operation/{}", status),
            ServiceErrorKind::Transport(code) => write!(f, "{}", code),
        }
    }
}

/// Failure reported by the remote service
///
/// # Examples
///
/// ```
/// use sessionpool::{Classify, OperationStatus, ServiceError, StatusCode};
///
/// let err = ServiceError::operation(StatusCode::Overloaded, "too many requests");
/// assert_eq!(err.retry_mode().operation_status(), OperationStatus::Retryable);
/// ```
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    kind: ServiceErrorKind,
    message: String,
}

impl ServiceError {
    pub fn operation(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Operation(status),
            message: message.into(),
        }
    }

    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Transport(code),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_reports_counts() {
        let err = PoolError::Exhausted {
            attempts: 100,
            elapsed: Duration::from_millis(1500),
            index: 3,
            busy: 3,
            idle: 0,
            create_in_progress: 0,
            last_error: "pool is overflowed".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("attempts: 100"));
        assert!(text.contains("3 busy, 0 idle, 0 create_in_progress"));
    }

    #[test]
    fn test_transient_pool_errors() {
        assert!(PoolError::Overflow.is_transient());
        assert!(PoolError::NoProgress.is_transient());
        assert!(PoolError::CreateTimeout(Duration::from_secs(1)).is_transient());
        assert!(!PoolError::Closed.is_transient());
        assert!(!PoolError::Cancelled.is_transient());

        let err: Error<ServiceError> = PoolError::Overflow.into();
        assert!(err.is_transient());
        let err: Error<ServiceError> =
            Error::Create(ServiceError::operation(StatusCode::Unavailable, "down"));
        assert!(err.is_transient());
        let err: Error<ServiceError> =
            Error::Create(ServiceError::operation(StatusCode::Unauthorized, "denied"));
        assert!(!err.is_transient());
        let err: Error<ServiceError> =
            Error::Create(ServiceError::operation(StatusCode::Timeout, "unknown"));
        assert!(!err.is_transient());
        let err: Error<ServiceError> =
            Error::Operation(ServiceError::operation(StatusCode::Overloaded, "busy"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_retry_error_accessors() {
        let err: RetryError<PoolError> = RetryError::Failed {
            attempts: 3,
            source: PoolError::Closed,
        };
        assert_eq!(err.attempts(), 3);
        assert!(!err.is_cancelled());
        assert!(matches!(err.into_inner(), Some(PoolError::Closed)));

        let err: RetryError<PoolError> = RetryError::Cancelled { attempts: 0 };
        assert!(err.is_cancelled());
        assert!(err.into_inner().is_none());
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::operation(StatusCode::BadSession, "session gone");
        assert_eq!(err.to_string(), "operation/BAD_SESSION/400100: session gone");

        let err = ServiceError::transport(TransportCode::Unavailable, "connection refused");
        assert_eq!(err.to_string(), "transport/Unavailable/14: connection refused");
    }
}
