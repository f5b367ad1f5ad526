//! Session pool: bounded admission, FIFO wait queue and graceful shutdown

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classify::Classify;
use crate::config::{CloseItemFn, PoolConfiguration};
use crate::errors::{BoxError, Error, PoolError, RetryError};
use crate::eviction::ItemInfo;
use crate::metrics::{MetricsTracker, PoolMetrics, Stats};
use crate::retry::{retry, RetryOptions};
use crate::trace::{ChangeInfo, CloseDoneInfo, NewInfo, TryDoneInfo, WithDoneInfo};

/// Upper bound on internal attempts of one acquisition
const MAX_GET_ATTEMPTS: usize = 100;

/// A resource the pool can hold
///
/// `close` may be called on an item that is no longer alive and must
/// tolerate being the last thing that happens to it.
#[async_trait]
pub trait Item: Send + Sync + 'static {
    fn is_alive(&self) -> bool;

    async fn close(&mut self, token: &CancellationToken) -> Result<(), BoxError>;
}

/// Identity of an item inside one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Slot<T> {
    id: ItemId,
    item: T,
}

type CreateResult<T, E> = Result<Slot<T>, Error<E>>;

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<Slot<T>>,
}

struct State<T> {
    limit: usize,
    index: HashMap<ItemId, ItemInfo>,
    idle: VecDeque<Slot<T>>,
    wait_queue: VecDeque<Waiter<T>>,
    create_in_progress: usize,
    next_waiter: u64,
}

impl<T> State<T> {
    fn stats(&self) -> Stats {
        Stats {
            limit: self.limit,
            index: self.index.len(),
            idle: self.idle.len(),
            create_in_progress: self.create_in_progress,
            waiting: self.wait_queue.len(),
        }
    }
}

struct PoolInner<T, E> {
    config: PoolConfiguration<T, E>,
    state: RwLock<State<T>>,
    done: CancellationToken,
    closed: AtomicBool,
    next_id: AtomicU64,
    metrics: MetricsTracker,
}

/// Async pool of reusable sessions
///
/// Cloning is cheap; clones share the same items.
///
/// # Examples
///
/// ```
/// use sessionpool::{BoxError, Item, Pool, PoolConfiguration, RetryOptions, ServiceError};
/// use tokio_util::sync::CancellationToken;
///
/// struct Session {
///     queries: usize,
/// }
///
/// #[async_trait::async_trait]
/// impl Item for Session {
///     fn is_alive(&self) -> bool {
///         true
///     }
///
///     async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = PoolConfiguration::new(|_token| async { Ok(Session { queries: 0 }) });
/// let pool: Pool<Session, ServiceError> = Pool::new(config.with_limit(4));
///
/// let token = CancellationToken::new();
/// let queries = pool
///     .with(&token, &RetryOptions::new(), |session| {
///         Box::pin(async move {
///             session.queries += 1;
///             Ok(session.queries)
///         })
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(queries, 1);
/// assert_eq!(pool.stats().idle, 1);
/// pool.close().await.unwrap();
/// # }
/// ```
pub struct Pool<T, E> {
    inner: Arc<PoolInner<T, E>>,
}

impl<T, E> Clone for Pool<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Pool<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.inner.state.read().stats())
            .field("closed", &self.inner.done.is_cancelled())
            .finish()
    }
}

impl<T, E> Pool<T, E>
where
    T: Item,
    E: StdError + Classify + Send + Sync + 'static,
{
    /// Create a pool. No item is created until the first acquisition.
    pub fn new(config: PoolConfiguration<T, E>) -> Self {
        let limit = config.limit;
        let inner = PoolInner {
            state: RwLock::new(State {
                limit,
                index: HashMap::new(),
                idle: VecDeque::new(),
                wait_queue: VecDeque::new(),
                create_in_progress: 0,
                next_waiter: 0,
            }),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            metrics: MetricsTracker::new(),
            config,
        };

        tracing::info!(limit, "session pool created");
        inner.config.trace.on_new(NewInfo { limit });

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Run `f` against a pooled item, retrying per `options`
    ///
    /// An error from `f` whose classification demands invalidation
    /// discards the item instead of returning it to the pool.
    pub async fn with<R, F>(
        &self,
        token: &CancellationToken,
        options: &RetryOptions,
        f: F,
    ) -> Result<R, RetryError<Error<E>>>
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
    {
        let start = Instant::now();
        let f = &f;
        let mut attempts = 0usize;

        let result = retry(token, options, || {
            attempts += 1;
            async move { self.try_with(token, f).await }
        })
        .await;

        self.inner.config.trace.on_with(WithDoneInfo {
            attempts,
            latency: start.elapsed(),
            error: result.as_ref().err().map(|err| err as &(dyn StdError + 'static)),
        });

        result
    }

    /// Acquire one item, without an outer retry loop
    pub async fn get(&self, token: &CancellationToken) -> Result<PooledItem<T, E>, Error<E>> {
        if self.inner.done.is_cancelled() {
            return Err(PoolError::Closed.into());
        }
        if token.is_cancelled() {
            return Err(PoolError::Cancelled.into());
        }

        let slot = self.inner.get_item(token).await?;
        MetricsTracker::incr(&self.inner.metrics.checkouts);

        Ok(PooledItem {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Close the pool
    ///
    /// Idle items are disposed concurrently and awaited. Items checked out
    /// at this moment are disposed when they come back. A second call fails
    /// with [`PoolError::Closed`].
    pub async fn close(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(PoolError::Closed);
        }
        inner.done.cancel();

        let drained: Vec<Slot<T>> = {
            let mut state = inner.state.write();
            state.limit = 0;
            state.wait_queue.clear();
            let drained: Vec<_> = state.idle.drain(..).collect();
            for slot in &drained {
                state.index.remove(&slot.id);
            }
            inner.notify_change(&state);
            drained
        };

        let closed_items = drained.len();
        let mut closing = JoinSet::new();
        for slot in drained {
            closing.spawn(inner.close_future(slot));
        }
        while let Some(joined) = closing.join_next().await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "item close task failed");
            }
        }

        tracing::info!(closed_items, "session pool closed");
        inner.config.trace.on_close(CloseDoneInfo {
            closed_items,
            error: None,
        });

        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.inner.state.read().stats()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics.get_metrics(&self.stats())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    async fn try_with<R, F>(&self, token: &CancellationToken, f: &F) -> Result<R, Error<E>>
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
    {
        let start = Instant::now();
        let result = self.run_once(token, f).await;

        self.inner.config.trace.on_try(TryDoneInfo {
            latency: start.elapsed(),
            error: result.as_ref().err().map(|err| err as &(dyn StdError + 'static)),
        });

        result
    }

    async fn run_once<R, F>(&self, token: &CancellationToken, f: &F) -> Result<R, Error<E>>
    where
        F: for<'a> Fn(&'a mut T) -> BoxFuture<'a, Result<R, E>>,
    {
        let mut item = self.get(token).await?;

        match f(&mut *item).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.retry_mode().must_invalidate() {
                    item.invalidate();
                }
                Err(Error::Operation(err))
            }
        }
    }
}

impl<T, E> PoolInner<T, E>
where
    T: Item,
    E: StdError + Classify + Send + 'static,
{
    async fn get_item(self: &Arc<Self>, token: &CancellationToken) -> Result<Slot<T>, Error<E>> {
        let start = Instant::now();
        let mut last_error: Option<Error<E>> = None;

        for _ in 0..MAX_GET_ATTEMPTS {
            if self.done.is_cancelled() {
                return Err(PoolError::Closed.into());
            }
            if token.is_cancelled() {
                return Err(PoolError::Cancelled.into());
            }

            if let Some((slot, touched)) = self.take_idle() {
                if slot.item.is_alive() {
                    if !self.config.idle_threshold.is_stale(touched, self.config.clock.as_ref()) {
                        return Ok(slot);
                    }
                    self.evict(slot, "idle threshold exceeded");
                    continue;
                }
                self.evict(slot, "item is not alive");
            }

            match self.create_item(token).await {
                Ok(slot) => return Ok(slot),
                Err(err) if err.is_transient() => last_error = Some(err),
                Err(err) => return Err(err),
            }

            match self.wait_from_queue(token).await {
                Ok(Some(slot)) => return Ok(slot),
                Ok(None) => {}
                Err(err) if err.is_transient() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        let stats = self.state.read().stats();
        let elapsed = start.elapsed();
        tracing::warn!(
            attempts = MAX_GET_ATTEMPTS,
            ?elapsed,
            index = stats.index,
            idle = stats.idle,
            create_in_progress = stats.create_in_progress,
            "failed to get item from pool"
        );

        Err(PoolError::Exhausted {
            attempts: MAX_GET_ATTEMPTS,
            elapsed,
            index: stats.index,
            busy: stats.busy(),
            idle: stats.idle,
            create_in_progress: stats.create_in_progress,
            last_error: last_error.map(|err| err.to_string()).unwrap_or_default(),
        }
        .into())
    }

    /// Pops the oldest idle item and marks it busy
    fn take_idle(&self) -> Option<(Slot<T>, Instant)> {
        let mut state = self.state.write();
        let slot = state.idle.pop_front()?;
        let info = match state.index.get_mut(&slot.id) {
            Some(info) => info,
            None => panic!("idle item {} has no index record", slot.id),
        };
        assert!(info.idle, "idle item {} is marked busy", slot.id);
        info.make_busy();
        let touched = info.touched;
        self.notify_change(&state);
        Some((slot, touched))
    }

    /// Admits one creation and waits for its outcome
    async fn create_item(self: &Arc<Self>, token: &CancellationToken) -> CreateResult<T, E> {
        {
            let mut state = self.state.write();
            if state.index.len() + state.create_in_progress >= state.limit {
                MetricsTracker::incr(&self.metrics.overflow_events);
                return Err(PoolError::Overflow.into());
            }
            state.create_in_progress += 1;
            self.notify_change(&state);
        }

        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(Arc::clone(self).run_create(tx));

        tokio::select! {
            biased;
            _ = self.done.cancelled() => {
                self.recover_creation(rx);
                Err(PoolError::Closed.into())
            }
            _ = token.cancelled() => {
                self.recover_creation(rx);
                Err(PoolError::Cancelled.into())
            }
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(PoolError::NoProgress.into()),
            },
        }
    }

    /// Background half of [`create_item`](Self::create_item)
    ///
    /// Runs to completion even if the caller stopped listening; an item
    /// nobody receives goes through the return path.
    async fn run_create(self: Arc<Self>, tx: oneshot::Sender<CreateResult<T, E>>) {
        let create = (self.config.create_item)(self.done.child_token());
        let outcome = match self.config.create_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, create).await {
                Ok(created) => created.map_err(Error::Create),
                Err(_) => Err(PoolError::CreateTimeout(timeout).into()),
            },
            None => create.await.map_err(Error::Create),
        };

        let result = {
            let mut state = self.state.write();
            state.create_in_progress -= 1;
            let result = outcome.map(|item| {
                let id = ItemId(self.next_id.fetch_add(1, Ordering::Relaxed));
                state.index.insert(id, ItemInfo::busy(self.config.clock.now()));
                Slot { id, item }
            });
            self.notify_change(&state);
            result
        };

        match &result {
            Ok(slot) => {
                MetricsTracker::incr(&self.metrics.items_created);
                tracing::debug!(item_id = %slot.id, "item created");
            }
            Err(err) => {
                MetricsTracker::incr(&self.metrics.create_failures);
                tracing::debug!(error = %err, "item creation failed");
            }
        }

        if let Err(Ok(slot)) = tx.send(result) {
            tracing::debug!(item_id = %slot.id, "creation abandoned by caller");
            let _ = self.put_item(slot);
        }
    }

    /// Picks up an item the creation task managed to send before the
    /// receiver was closed
    fn recover_creation(&self, mut rx: oneshot::Receiver<CreateResult<T, E>>) {
        rx.close();
        if let Ok(Ok(slot)) = rx.try_recv() {
            let _ = self.put_item(slot);
        }
    }

    /// Parks in the wait queue until an item is handed over
    ///
    /// `Ok(None)` means the creation timeout elapsed first.
    async fn wait_from_queue(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<Slot<T>>, Error<E>> {
        let (tx, rx) = oneshot::channel();
        let waiter = {
            let mut state = self.state.write();
            if self.done.is_cancelled() {
                return Err(PoolError::Closed.into());
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.wait_queue.push_back(Waiter { id, tx });
            self.notify_change(&state);
            id
        };
        MetricsTracker::incr(&self.metrics.wait_events);

        let timeout = self.config.create_timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        // Dropping the guard on any early exit leaves the queue
        let mut queued = QueuedWaiter {
            pool: self,
            id: waiter,
            rx: Some(rx),
        };
        let delivered = tokio::select! {
            biased;
            _ = self.done.cancelled() => return Err(PoolError::Closed.into()),
            _ = token.cancelled() => return Err(PoolError::Cancelled.into()),
            delivered = &mut queued => Some(delivered),
            _ = deadline => None,
        };

        let Some(delivered) = delivered else {
            return Ok(queued.abandon());
        };
        queued.disarm();
        match delivered {
            Ok(slot) => Ok(Some(slot)),
            Err(_) if self.done.is_cancelled() => Err(PoolError::Closed.into()),
            Err(_) => Err(PoolError::NoProgress.into()),
        }
    }
}

/// Wait-queue entry owned by an acquiring future
///
/// Dropped while still armed, it removes its entry and returns any item
/// that was handed over in the meantime.
struct QueuedWaiter<'a, T: Item, E> {
    pool: &'a PoolInner<T, E>,
    id: u64,
    rx: Option<oneshot::Receiver<Slot<T>>>,
}

impl<T: Item, E> QueuedWaiter<'_, T, E> {
    fn abandon(mut self) -> Option<Slot<T>> {
        let rx = self.rx.take()?;
        self.pool.abandon(self.id, rx)
    }

    fn disarm(&mut self) {
        self.rx = None;
    }
}

impl<T: Item, E> Future for QueuedWaiter<'_, T, E> {
    type Output = Result<Slot<T>, oneshot::error::RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().rx.as_mut() {
            Some(rx) => Pin::new(rx).poll(cx),
            None => Poll::Pending,
        }
    }
}

impl<T: Item, E> Drop for QueuedWaiter<'_, T, E> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            if let Some(slot) = self.pool.abandon(self.id, rx) {
                let _ = self.pool.put_item(slot);
            }
        }
    }
}

impl<T: Item, E> PoolInner<T, E> {
    /// Returns an item to the pool, or disposes it
    fn put_item(&self, slot: Slot<T>) -> Result<(), PoolError> {
        let alive = slot.item.is_alive();
        let mut state = self.state.write();
        assert!(
            state.index.contains_key(&slot.id),
            "returned item {} is not indexed",
            slot.id
        );

        let rejection = if self.done.is_cancelled() {
            Some(PoolError::Closed)
        } else if !alive {
            Some(PoolError::ItemNotAlive)
        } else if state.idle.len() >= state.limit {
            Some(PoolError::Overflow)
        } else {
            None
        };

        if let Some(err) = rejection {
            state.index.remove(&slot.id);
            self.notify_change(&state);
            drop(state);
            tracing::debug!(item_id = %slot.id, reason = %err, "returned item rejected");
            self.dispose(slot);
            return Err(err);
        }

        MetricsTracker::incr(&self.metrics.returns);
        if let Some(slot) = Self::notify(&mut state, slot) {
            let now = self.config.clock.now();
            if let Some(info) = state.index.get_mut(&slot.id) {
                info.make_idle(now);
            }
            state.idle.push_back(slot);
        }
        self.notify_change(&state);
        Ok(())
    }

    /// Hands `slot` to the oldest waiter still listening
    ///
    /// Gives the item back if nobody took it.
    fn notify(state: &mut State<T>, mut slot: Slot<T>) -> Option<Slot<T>> {
        while let Some(waiter) = state.wait_queue.pop_front() {
            match waiter.tx.send(slot) {
                Ok(()) => return None,
                Err(returned) => slot = returned,
            }
        }
        Some(slot)
    }

    /// Removes a waiter that stopped waiting and recovers anything it was sent
    fn abandon(&self, waiter: u64, mut rx: oneshot::Receiver<Slot<T>>) -> Option<Slot<T>> {
        {
            let mut state = self.state.write();
            if let Some(position) = state.wait_queue.iter().position(|w| w.id == waiter) {
                state.wait_queue.remove(position);
                self.notify_change(&state);
            }
        }
        rx.close();
        rx.try_recv().ok()
    }

    /// Closes a busy item and forgets it
    fn evict(&self, slot: Slot<T>, reason: &'static str) {
        MetricsTracker::incr(&self.metrics.evictions);
        tracing::debug!(item_id = %slot.id, reason, "evicting item");
        self.invalidate(slot);
    }

    fn invalidate(&self, slot: Slot<T>) {
        {
            let mut state = self.state.write();
            state.index.remove(&slot.id);
            self.notify_change(&state);
        }
        self.dispose(slot);
    }

    /// Schedules the disposer for `slot` on the current runtime
    fn dispose(&self, slot: Slot<T>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.close_future(slot));
            }
            Err(_) => {
                tracing::warn!(item_id = %slot.id, "no runtime to close item on, dropping it");
            }
        }
    }

    fn close_future(&self, slot: Slot<T>) -> BoxFuture<'static, ()> {
        MetricsTracker::incr(&self.metrics.items_closed);
        let close_item: Option<CloseItemFn<T>> = self.config.close_item.clone();
        let timeout: Option<Duration> = self.config.close_timeout;

        Box::pin(async move {
            let Slot { id, mut item } = slot;
            // Fires once the close timeout elapses
            let token = CancellationToken::new();
            let close_token = token.clone();
            let close: BoxFuture<'static, Result<(), BoxError>> = match close_item {
                Some(close_item) => {
                    let closing = close_item(item);
                    Box::pin(async move {
                        closing.await;
                        Ok(())
                    })
                }
                None => Box::pin(async move { item.close(&close_token).await }),
            };

            let result = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, close).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(format!("close timed out after {:?}", timeout).into())
                    }
                },
                None => close.await,
            };

            match result {
                Ok(()) => tracing::debug!(item_id = %id, "item closed"),
                Err(err) => tracing::warn!(item_id = %id, error = %err, "failed to close item"),
            }
        })
    }

    fn notify_change(&self, state: &State<T>) {
        let stats = state.stats();
        self.config.trace.on_change(ChangeInfo {
            limit: stats.limit,
            index: stats.index,
            idle: stats.idle,
            create_in_progress: stats.create_in_progress,
            waiting: stats.waiting,
        });
    }
}

/// An item checked out of a [`Pool`]
///
/// Goes back to the pool when dropped.
pub struct PooledItem<T: Item, E> {
    slot: Option<Slot<T>>,
    pool: Arc<PoolInner<T, E>>,
}

impl<T: Item, E> PooledItem<T, E> {
    pub fn id(&self) -> ItemId {
        self.slot().id
    }

    /// Dispose of the item instead of returning it
    pub fn invalidate(mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::debug!(item_id = %slot.id, "item invalidated");
            self.pool.invalidate(slot);
        }
    }

    fn slot(&self) -> &Slot<T> {
        self.slot.as_ref().expect("item already released")
    }
}

impl<T: Item, E> Deref for PooledItem<T, E> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.slot().item
    }
}

impl<T: Item, E> DerefMut for PooledItem<T, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().expect("item already released").item
    }
}

impl<T: Item, E> Drop for PooledItem<T, E> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let _ = self.pool.put_item(slot);
        }
    }
}

impl<T: Item + fmt::Debug, E> fmt::Debug for PooledItem<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledItem")
            .field("id", &self.id())
            .field("item", &**self)
            .finish()
    }
}
