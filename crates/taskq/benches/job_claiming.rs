//! Job claiming benchmark
//!
//! Benchmarks the critical path: add → claim → complete, first against the
//! store directly and then through one-shot workers.

use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use taskq::persistence::{InMemoryJobSource, JobSource, NewJob};
use taskq::{run_once, Engine, TaskList, TaskOutput, WorkerConfig, WorkerPool};

/// Claim and complete directly against the store (baseline)
fn bench_claim_complete(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("job_claiming/store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("claim_complete", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = InMemoryJobSource::new();
            let ids = store
                .register_tasks(&["bench".to_string()])
                .await
                .unwrap();
            let task_ids: Vec<_> = ids.into_iter().map(|(id, _)| id).collect();

            for i in 0..iters {
                store
                    .add_job(NewJob::new("bench", json!({ "n": i })))
                    .await
                    .unwrap();
            }

            let start = Instant::now();
            while let Some(job) = store.claim("worker-1", &task_ids, None).await.unwrap() {
                store.complete("worker-1", &job).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Drain a queue with a pool of one-shot workers (contention)
fn bench_worker_pool(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("job_claiming/workers");
    group.sample_size(20);

    let job_count = 2000u64;
    group.throughput(Throughput::Elements(job_count));

    for concurrency in [1, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("concurrency", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async move {
                    let store = Arc::new(InMemoryJobSource::new());
                    for i in 0..job_count {
                        store
                            .add_job(NewJob::new("bench", json!({ "n": i })))
                            .await
                            .unwrap();
                    }

                    let tasks = TaskList::new().with_fn("bench", |_, _| async { Ok(TaskOutput::Done) });
                    let config = WorkerConfig::default()
                        .with_continuous(false)
                        .with_concurrency(concurrency)
                        .with_log_success(false);

                    if concurrency == 1 {
                        run_once(Engine::new(config), store, tasks).await.unwrap();
                    } else {
                        let pool = WorkerPool::start(Engine::new(config), store, tasks);
                        pool.wait().await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_claim_complete, bench_worker_pool);
criterion_main!(benches);
