use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sessionpool::{
    Backoff, BoxError, Item, LogBackoff, Pool, PoolConfiguration, RetryOptions, ServiceError,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Session;

#[async_trait::async_trait]
impl Item for Session {
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }
}

fn backoff_delay(c: &mut Criterion) {
    let jittered = LogBackoff::new(Duration::from_millis(5), 6, 0.5);
    let exact = LogBackoff::new(Duration::from_millis(5), 6, 1.0);

    c.bench_function("backoff_delay_jittered", |b| {
        b.iter(|| jittered.delay(black_box(4)))
    });
    c.bench_function("backoff_delay_exact", |b| b.iter(|| exact.delay(black_box(4))));
}

fn uncontended_with(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let pool: Pool<Session, ServiceError> =
        Pool::new(PoolConfiguration::new(|_token| async { Ok(Session) }).with_limit(1));
    let token = CancellationToken::new();
    let options = RetryOptions::new();

    c.bench_function("pool_with_uncontended", |b| {
        b.iter(|| {
            runtime.block_on(async {
                pool.with(&token, &options, |_session| Box::pin(async { Ok(black_box(1)) }))
                    .await
                    .unwrap()
            })
        })
    });

    runtime.block_on(async { pool.close().await.unwrap() });
}

criterion_group!(benches, backoff_delay, uncontended_with);
criterion_main!(benches);
