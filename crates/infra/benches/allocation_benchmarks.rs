use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use forgequeue_core::{NewWork, WorkItem, WorkOutput};
use forgequeue_events::{InMemoryEventBus, WorkEvent};
use forgequeue_infra::store::{Allocation, InMemoryWorkStore, WorkSelector, WorkStore};
use forgequeue_infra::{AdapterOptions, AdapterRegistry, Director, WorkerScope};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::runtime::Runtime;

type BenchDirector = Director<Arc<InMemoryWorkStore>, Arc<InMemoryEventBus<WorkEvent>>>;

async fn noop(input: JsonValue) -> anyhow::Result<WorkOutput> {
    Ok(WorkOutput::success(input))
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn director() -> BenchDirector {
    let registry = Arc::new(AdapterRegistry::new());
    registry.register_fn("noop", noop, AdapterOptions::default()).unwrap();
    Director::new(InMemoryWorkStore::arc(), Arc::new(InMemoryEventBus::new()), registry)
}

/// Store pre-filled with `n` NEW items of mixed priority.
async fn seeded_store(n: usize) -> Arc<InMemoryWorkStore> {
    let store = InMemoryWorkStore::arc();
    let now = Utc::now();
    for i in 0..n {
        let new = NewWork::new("noop", json!({ "i": i })).with_priority((i % 10) as i32);
        store.insert(WorkItem::from_new(new, now)).await.unwrap();
    }
    store
}

fn bench_allocate_atomic(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("allocate_atomic");

    for queue_depth in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(queue_depth),
            &queue_depth,
            |b, &n| {
                b.iter_batched(
                    || rt.block_on(seeded_store(n)),
                    |store| {
                        rt.block_on(async {
                            let now = Utc::now();
                            let selector = WorkSelector {
                                scheduled_until: Some(now),
                                ..WorkSelector::default()
                            }
                            .with_types(["noop"]);
                            let allocation = Allocation {
                                started: now,
                                worker: "bench".to_string(),
                            };
                            black_box(store.allocate_atomic(&selector, allocation).await.unwrap())
                        })
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_process_pipeline(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("find_one_and_process_work");

    for batch in [10usize, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &n| {
            b.iter_batched(
                || {
                    let director = director();
                    rt.block_on(async {
                        for i in 0..n {
                            director.add_work(NewWork::new("noop", json!({ "i": i }))).await.unwrap();
                        }
                    });
                    director
                },
                |director| {
                    rt.block_on(async {
                        let scope = WorkerScope::new("bench", ["noop"]);
                        while let Some(done) = director.find_one_and_process_work(&scope).await.unwrap() {
                            black_box(done);
                        }
                    })
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocate_atomic, bench_process_pipeline);
criterion_main!(benches);
