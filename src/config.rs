//! Pool configuration options

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::eviction::IdleThreshold;
use crate::trace::{NoopTrace, PoolTrace};

/// Default maximum number of items
pub const DEFAULT_LIMIT: usize = 50;

/// Default time budget for creating one item
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time budget for closing one item
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type CreateItemFn<T, E> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub(crate) type CloseItemFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration for session pool behavior
///
/// The factory receives a token that fires when the pool closes; the
/// caller's own cancellation never aborts a creation that was admitted.
///
/// # Examples
///
/// ```
/// use sessionpool::{PoolConfiguration, ServiceError};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::<u32, ServiceError>::new(|_token| async { Ok(7) })
///     .with_limit(10)
///     .with_create_timeout(Duration::from_secs(2))
///     .with_idle_threshold(Duration::from_secs(300));
///
/// assert_eq!(config.limit, 10);
/// assert_eq!(config.create_timeout, Some(Duration::from_secs(2)));
/// ```
pub struct PoolConfiguration<T, E> {
    /// Maximum number of items, counting those being created
    pub limit: usize,

    /// Timeout for creating one item; also bounds one wait in the queue
    pub create_timeout: Option<Duration>,

    /// Timeout for closing one item
    pub close_timeout: Option<Duration>,

    /// Idle items older than this are closed on their next checkout
    pub idle_threshold: IdleThreshold,

    pub(crate) create_item: CreateItemFn<T, E>,
    pub(crate) close_item: Option<CloseItemFn<T>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) trace: Arc<dyn PoolTrace>,
}

impl<T, E> PoolConfiguration<T, E> {
    /// Create a configuration with default values around an item factory
    pub fn new<F, Fut>(create_item: F) -> Self
    where
        T: 'static,
        E: 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            limit: DEFAULT_LIMIT,
            create_timeout: Some(DEFAULT_CREATE_TIMEOUT),
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            idle_threshold: IdleThreshold::Disabled,
            create_item: Arc::new(move |token| -> BoxFuture<'static, Result<T, E>> {
                Box::pin(create_item(token))
            }),
            close_item: None,
            clock: Arc::new(SystemClock),
            trace: Arc::new(NoopTrace),
        }
    }

    /// Set the maximum number of items
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the creation timeout. Zero disables it.
    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the close timeout. Zero disables it.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the idle-staleness threshold. Zero disables it.
    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = IdleThreshold::from(threshold);
        self
    }

    /// Replace the default disposer, which calls [`Item::close`](crate::Item::close)
    pub fn with_close_item<F, Fut>(mut self, close_item: F) -> Self
    where
        T: 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.close_item = Some(Arc::new(move |item| -> BoxFuture<'static, ()> {
            Box::pin(close_item(item))
        }));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn PoolTrace>) -> Self {
        self.trace = trace;
        self
    }
}

impl<T, E> Clone for PoolConfiguration<T, E> {
    fn clone(&self) -> Self {
        Self {
            limit: self.limit,
            create_timeout: self.create_timeout,
            close_timeout: self.close_timeout,
            idle_threshold: self.idle_threshold,
            create_item: Arc::clone(&self.create_item),
            close_item: self.close_item.clone(),
            clock: Arc::clone(&self.clock),
            trace: Arc::clone(&self.trace),
        }
    }
}

impl<T, E> fmt::Debug for PoolConfiguration<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfiguration")
            .field("limit", &self.limit)
            .field("create_timeout", &self.create_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("idle_threshold", &self.idle_threshold)
            .field("custom_close_item", &self.close_item.is_some())
            .field("clock", &self.clock)
            .field("trace", &self.trace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;

    fn config() -> PoolConfiguration<u32, ServiceError> {
        PoolConfiguration::new(|_token| async { Ok(1) })
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.limit, DEFAULT_LIMIT);
        assert_eq!(config.create_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.close_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.idle_threshold, IdleThreshold::Disabled);
        assert!(config.close_item.is_none());
    }

    #[test]
    fn test_zero_durations_disable() {
        let config = config()
            .with_create_timeout(Duration::ZERO)
            .with_close_timeout(Duration::ZERO)
            .with_idle_threshold(Duration::ZERO);

        assert_eq!(config.create_timeout, None);
        assert_eq!(config.close_timeout, None);
        assert_eq!(config.idle_threshold, IdleThreshold::Disabled);
    }

    #[test]
    fn test_builder_fluent() {
        let config = config()
            .with_limit(3)
            .with_idle_threshold(Duration::from_secs(60))
            .with_close_item(|_item| async {});

        assert_eq!(config.limit, 3);
        assert_eq!(config.idle_threshold, IdleThreshold::After(Duration::from_secs(60)));
        assert!(config.close_item.is_some());
        assert!(format!("{:?}", config).contains("custom_close_item: true"));
    }

    #[tokio::test]
    async fn test_factory_is_boxed() {
        let config = config();
        let item = (config.create_item)(CancellationToken::new()).await.unwrap();
        assert_eq!(item, 1);
    }
}
