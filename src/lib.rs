//! # sessionpool
//!
//! Async pool of long-lived remote sessions with a classifying retry engine.
//!
//! ## Features
//!
//! - Bounded admission: items plus in-flight creations never exceed the limit
//! - Asynchronous item creation and disposal with per-call timeouts
//! - Strict FIFO wait queue with direct handoff on return
//! - Idle-staleness eviction and liveness checks
//! - Graceful, idempotent shutdown
//! - Retry loop driven by error classification, with logarithmic backoff
//! - Instrumentation hooks and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use sessionpool::{BoxError, Item, Pool, PoolConfiguration, RetryOptions, ServiceError};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Session;
//!
//! #[async_trait::async_trait]
//! impl Item for Session {
//!     fn is_alive(&self) -> bool {
//!         true
//!     }
//!
//!     async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool: Pool<Session, ServiceError> =
//!     Pool::new(PoolConfiguration::new(|_token| async { Ok(Session) }));
//! let token = CancellationToken::new();
//!
//! let answer = pool
//!     .with(&token, &RetryOptions::new().with_idempotent(true), |_session| {
//!         Box::pin(async { Ok(42) })
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(answer, 42);
//!
//! // Item is back in the pool once the closure finishes
//! assert_eq!(pool.stats().idle, 1);
//! pool.close().await.unwrap();
//! # }
//! ```

mod backoff;
mod classify;
mod clock;
mod config;
mod errors;
mod eviction;
mod metrics;
mod pool;
mod retry;
mod trace;

pub use backoff::{Backoff, LogBackoff};
pub use classify::{BackoffType, Classify, OperationStatus, RetryMode, Retryable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_CREATE_TIMEOUT, DEFAULT_LIMIT, PoolConfiguration};
pub use errors::{
    BoxError, Error, PoolError, RetryError, ServiceError, ServiceErrorKind, StatusCode,
    TransportCode,
};
pub use eviction::IdleThreshold;
#[cfg(feature = "metrics")]
pub use metrics::PrometheusTrace;
pub use metrics::{MetricsExporter, PoolMetrics, Stats};
pub use pool::{Item, ItemId, Pool, PooledItem};
pub use retry::{RetryOptions, retry, wait};
pub use trace::{
    ChangeInfo, CloseDoneInfo, NewInfo, NoopTrace, PoolTrace, RetryTrace, TryDoneInfo, WithDoneInfo,
};
