//! Benchmarks for the restraint admission queue.

#![allow(clippy::unwrap_used)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

use planflow::ambiance::{Ambiance, Level};
use planflow::plan::PlanNode;
use planflow::restraint::{HoldingScope, RestraintService};
use planflow::store::InMemoryStore;

fn holder_ambiance(index: usize) -> Ambiance {
    let node = PlanNode::new(format!("holder_{index}"), "Holder", "shell");
    Ambiance::new(
        "pe-bench",
        "bench",
        HashMap::new(),
        Level::from_plan_node(&node),
    )
}

fn fresh_service() -> RestraintService {
    RestraintService::new(Arc::new(InMemoryStore::new()))
}

fn acquire_release_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("restraint_acquire_release_uncontended", |b| {
        b.iter_batched(
            fresh_service,
            |service| {
                rt.block_on(async {
                    let instance = service
                        .acquire(
                            &holder_ambiance(0),
                            "db-migrations",
                            HoldingScope::Queue,
                            1,
                            None,
                        )
                        .await
                        .unwrap();
                    black_box(service.release(&instance.id).await.unwrap());
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn promotion_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let queue_depth = 8;

    c.bench_function("restraint_release_promotes_oldest_of_8", |b| {
        b.iter_batched(
            || {
                let service = fresh_service();
                let holder = rt.block_on(async {
                    let holder = service
                        .acquire(
                            &holder_ambiance(0),
                            "db-migrations",
                            HoldingScope::Queue,
                            1,
                            None,
                        )
                        .await
                        .unwrap();
                    for index in 1..=queue_depth {
                        service
                            .acquire(
                                &holder_ambiance(index),
                                "db-migrations",
                                HoldingScope::Queue,
                                1,
                                None,
                            )
                            .await
                            .unwrap();
                    }
                    holder
                });
                (service, holder)
            },
            |(service, holder)| {
                rt.block_on(async {
                    let promoted = service.release(&holder.id).await.unwrap();
                    black_box(promoted);
                });
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, acquire_release_benchmark, promotion_benchmark);
criterion_main!(benches);
