use parking_lot::Mutex;
use sessionpool::{
    Backoff, BackoffType, BoxError, ChangeInfo, Error, Item, LogBackoff, ManualClock, Pool,
    PoolConfiguration, PoolError, PoolTrace, RetryError, RetryOptions, Retryable, ServiceError,
    StatusCode, retry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Connection {
    id: usize,
}

#[async_trait::async_trait]
impl Item for Connection {
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Remembers the largest occupancy the pool ever reported
#[derive(Debug, Default)]
struct PeakTrace {
    peak: AtomicUsize,
    changes: Mutex<Vec<ChangeInfo>>,
}

impl PoolTrace for PeakTrace {
    fn on_change(&self, info: ChangeInfo) {
        self.peak.fetch_max(info.index, Ordering::SeqCst);
        self.changes.lock().push(info);
    }
}

fn connections(limit: usize) -> (PoolConfiguration<Connection, ServiceError>, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let factory = Arc::clone(&created);
    let config = PoolConfiguration::new(move |_token| {
        let id = factory.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(Connection { id })
        }
    })
    .with_limit(limit);
    (config, created)
}

async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_never_exceeds_limit() {
    let trace = Arc::new(PeakTrace::default());
    let (config, _) = connections(4);
    let pool = Pool::new(config.with_trace(trace.clone()));
    let token = CancellationToken::new();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            pool.with(&token, &RetryOptions::new(), |connection| {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    Ok(connection.id)
                })
            })
            .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert!(trace.peak.load(Ordering::SeqCst) <= 4);
    for change in trace.changes.lock().iter() {
        assert!(change.idle <= change.index);
    }
    let stats = pool.stats();
    assert_eq!(stats.create_in_progress, 0);
    assert_eq!(stats.idle, stats.index);
}

#[tokio::test]
async fn close_runs_disposer_once_per_idle_item() {
    let disposed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disposed);
    let (config, _) = connections(3);
    let pool = Pool::new(config.with_close_item(move |connection: Connection| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(connection.id);
        }
    }));
    let token = CancellationToken::new();

    let a = pool.get(&token).await.unwrap();
    let b = pool.get(&token).await.unwrap();
    drop(a);
    drop(b);

    pool.close().await.unwrap();
    let mut ids = disposed.lock().clone();
    ids.sort();
    assert_eq!(ids, vec![0, 1]);

    let result = pool
        .with(&token, &RetryOptions::new(), |connection| {
            Box::pin(async move { Ok(connection.id) })
        })
        .await;
    match result {
        Err(RetryError::Failed { source, .. }) => {
            assert!(matches!(source.as_pool_error(), Some(PoolError::Closed)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn fresh_idle_item_is_handed_out_unchanged() {
    let clock = Arc::new(ManualClock::new());
    let (config, created) = connections(1);
    let pool = Pool::new(
        config
            .with_idle_threshold(Duration::from_secs(60))
            .with_clock(clock.clone()),
    );
    let token = CancellationToken::new();

    let first = pool.get(&token).await.unwrap().id();
    clock.advance(Duration::from_secs(59));
    let second = pool.get(&token).await.unwrap().id();

    assert_eq!(first, second);
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_waiter_leaves_queue_unchanged() {
    let (config, _) = connections(1);
    let pool = Pool::new(config);
    let token = CancellationToken::new();
    let _held = pool.get(&token).await.unwrap();
    let before = pool.stats().waiting;

    let caller = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            pool.with(&caller, &RetryOptions::new(), |connection| {
                Box::pin(async move { Ok(connection.id) })
            })
            .await
        })
    };
    until(|| pool.stats().waiting == before + 1).await;

    caller.cancel();
    match waiter.await.unwrap() {
        Err(RetryError::Failed { source, .. }) => {
            assert!(matches!(source, Error::Pool(PoolError::Cancelled)));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(pool.stats().waiting, before);
}

#[tokio::test]
async fn retryable_wrapper_keeps_retrying() {
    let token = CancellationToken::new();
    let options = RetryOptions::new()
        .with_fast_backoff(LogBackoff::new(Duration::from_micros(10), 3, 1.0));
    let mut calls = 0;

    let result = retry(&token, &options, || {
        calls += 1;
        let outcome = if calls < 10 {
            Err(Retryable::new(ServiceError::operation(StatusCode::GenericError, "flaky")))
        } else {
            Ok("done")
        };
        async move { outcome }
    })
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls, 10);
}

#[tokio::test]
async fn operation_error_passes_through_unchanged() {
    let (config, _) = connections(1);
    let pool = Pool::new(config);
    let token = CancellationToken::new();

    let result: Result<(), _> = pool
        .with(&token, &RetryOptions::new(), |_connection| {
            Box::pin(async { Err(ServiceError::operation(StatusCode::NotFound, "no such row")) })
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.attempts(), 1);
    match err.into_inner() {
        Some(Error::Operation(inner)) => assert_eq!(inner.message(), "no such row"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(pool.stats().idle, 1);
}

#[test]
fn backoff_grows_to_ceiling() {
    let backoff = LogBackoff::new(Duration::from_millis(10), 4, 0.5);
    let bound = Duration::from_millis(10 * 16);

    let mut previous = Duration::ZERO;
    for attempt in 0..8 {
        let max_delay = backoff.max_delay(attempt);
        assert!(max_delay >= previous);
        assert!(max_delay <= bound);
        previous = max_delay;

        let delay = backoff.delay(attempt);
        assert!(delay >= max_delay / 2);
        assert!(delay <= max_delay);
    }
    assert_eq!(backoff.max_delay(7), bound);
}

#[test]
fn backoff_class_follows_status() {
    use sessionpool::Classify;

    let overloaded = ServiceError::operation(StatusCode::Overloaded, "slow down");
    assert_eq!(overloaded.retry_mode().backoff(), BackoffType::Slow);

    let aborted = ServiceError::operation(StatusCode::Aborted, "retry now");
    assert_eq!(aborted.retry_mode().backoff(), BackoffType::None);
}
