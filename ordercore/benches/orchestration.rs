//! End-to-end orchestration benchmarks over the in-memory backends.

#![allow(missing_docs)]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ordercore::config::MaxRetryAttempts;
use ordercore::{OrderCore, OrderCoreConfig, OrderRequest, RetryPolicy};
use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
use ordercore_testing::FixedClock;
use serde_json::json;
use tokio::runtime::Runtime;

type MemoryCore = OrderCore<InMemoryOrderStore, InMemoryWorkQueue, InMemoryHistoryStore>;

fn core() -> MemoryCore {
    let config = OrderCoreConfig {
        retry: RetryPolicy::fast(MaxRetryAttempts::try_new(1).unwrap()),
        ..OrderCoreConfig::default()
    };
    OrderCore::new(
        &config,
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(InMemoryWorkQueue::new()),
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(FixedClock::default()),
    )
}

fn request(order_id: usize, lines: usize) -> OrderRequest {
    let items: Vec<_> = (0..lines)
        .map(|line| json!({ "sku": format!("SKU-{line}"), "qty": 2, "price": 19.99 }))
        .collect();
    serde_json::from_value(json!({
        "orderId": format!("ORD-{order_id}"),
        "customerId": "CUST-BENCH",
        "items": items,
    }))
    .unwrap()
}

fn bench_submit_and_process(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("submit_and_process");

    for lines in [1, 10, 50] {
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &lines, |b, &lines| {
            b.to_async(&rt).iter(|| async move {
                let core = core();
                core.intake().submit(request(0, lines)).await.unwrap();
                black_box(core.worker().drain().await.unwrap());
            });
        });
    }

    group.finish();
}

fn bench_redelivery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let core = core();
    rt.block_on(async {
        core.intake().submit(request(0, 10)).await.unwrap();
        core.worker().drain().await.unwrap();
    });
    let message = ordercore_types::DispatchMessage::new(
        ordercore_types::OrderId::try_new("ORD-0").unwrap(),
    );

    c.bench_function("redelivery_of_completed_order", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(core.listener().on_dispatch_message(&message).await.unwrap());
        });
    });
}

criterion_group!(benches, bench_submit_and_process, bench_redelivery);
criterion_main!(benches);
