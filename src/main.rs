// sessionpool demo
// Runs a few operations against an in-process fake backend

use sessionpool::{
    BoxError, Item, MetricsExporter, Pool, PoolConfiguration, RetryOptions, ServiceError,
    StatusCode,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct FakeSession {
    id: usize,
    queries: usize,
}

#[async_trait::async_trait]
impl Item for FakeSession {
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
        println!("  Closing session {} after {} queries", self.id, self.queries);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    println!("=== sessionpool demo ===\n");

    let sessions = Arc::new(AtomicUsize::new(0));
    let factory = Arc::clone(&sessions);
    let pool: Pool<FakeSession, ServiceError> = Pool::new(
        PoolConfiguration::new(move |_token| {
            let id = factory.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(FakeSession { id, queries: 0 })
            }
        })
        .with_limit(2),
    );
    let token = CancellationToken::new();

    // Example 1: a query that succeeds straight away
    println!("1. Simple query:");
    let result = pool
        .with(&token, &RetryOptions::new(), |session| {
            Box::pin(async move {
                session.queries += 1;
                Ok(format!("row from session {}", session.id))
            })
        })
        .await;
    println!("  Result: {:?}\n", result.map_err(|err| err.to_string()));

    // Example 2: the backend is overloaded twice before answering
    println!("2. Retried query:");
    let failures = AtomicUsize::new(0);
    let options = RetryOptions::new().with_id("retried-query").with_idempotent(true);
    let result = pool
        .with(&token, &options, |session| {
            let failed = failures.fetch_add(1, Ordering::SeqCst) < 2;
            Box::pin(async move {
                session.queries += 1;
                if failed {
                    Err(ServiceError::operation(
                        StatusCode::Aborted,
                        "transaction locks invalidated",
                    ))
                } else {
                    Ok(session.id)
                }
            })
        })
        .await;
    println!("  Answered by session {:?}\n", result.map_err(|err| err.to_string()));

    // Example 3: concurrent callers share two sessions
    println!("3. Concurrent queries:");
    let mut handles = Vec::new();
    for caller in 0..6 {
        let pool = pool.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            pool.with(&token, &RetryOptions::new(), |session| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    session.queries += 1;
                    Ok(session.id)
                })
            })
            .await
            .map(|session| (caller, session))
        }));
    }
    for handle in handles {
        if let Ok(Ok((caller, session))) = handle.await {
            println!("  Caller {} used session {}", caller, session);
        }
    }
    println!("  Stats: {:?}\n", pool.stats());

    // Example 4: metrics
    println!("4. Prometheus export:");
    print!("{}", MetricsExporter::export_prometheus(&pool.metrics(), "demo", None));
    println!();

    // Example 5: shutdown
    println!("5. Close:");
    if let Err(err) = pool.close().await {
        println!("  Close failed: {}", err);
    }
    println!("  Closed: {}", pool.is_closed());
}
