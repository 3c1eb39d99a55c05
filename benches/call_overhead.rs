//! Overhead of the query/mutation adapters over a bare request call
//!
//! This benchmark suite measures:
//! - A raw request call with the envelope unwrapped by hand
//! - The same call with hand-written loading/data/error bookkeeping
//! - Wrapped reads: cache hit, forced fetch and a full observer mount
//! - Wrapped mutations
//!
//! Run with: cargo bench --bench call_overhead
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use query_kit::{
    cache_key, normalize, use_api_mutation, use_api_query, Envelope, Error, QueryClient,
    QueryOptions, Response,
};
use std::hint::black_box;

// ============================================================================
// Benchmark Fixtures
// ============================================================================

#[derive(Clone)]
struct Todo {
    id: u32,
    title: String,
}

async fn get_todo(id: u32) -> Response<Todo, String> {
    Ok(Envelope::Ok(Todo {
        id,
        title: "bench".to_string(),
    }))
}

/// What callers write without the adapters.
#[derive(Default)]
struct ManualState {
    loading: bool,
    data: Option<Todo>,
    error: Option<String>,
}

// ============================================================================
// Group 1: Baseline
// ============================================================================

fn baseline_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("baseline");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    group.bench_function("raw_call", |b| {
        b.to_async(&rt)
            .iter(|| async { normalize(get_todo(black_box(1)).await).map(|t| t.id) });
    });

    group.bench_function("manual_state", |b| {
        b.to_async(&rt).iter(|| async {
            let mut state = ManualState {
                loading: true,
                ..ManualState::default()
            };
            match get_todo(black_box(1)).await {
                Ok(Envelope::Ok(todo)) => state.data = Some(todo),
                Ok(Envelope::Err(e)) => state.error = Some(e),
                Err(e) => state.error = Some(e.to_string()),
            }
            state.loading = false;
            black_box(state)
        });
    });

    group.finish();
}

// ============================================================================
// Group 2: Wrapped reads
// ============================================================================

fn query_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    // Fresh entry: lookup + downcast, no request
    group.bench_function("fetch_query_hit", |b| {
        let client = QueryClient::new();
        let opts = QueryOptions::default().stale_forever();
        rt.block_on(async {
            client
                .prefetch_query(cache_key!["todo", 1], || get_todo(1), opts.clone())
                .await;
        });

        b.to_async(&rt).iter(|| async {
            client
                .fetch_query(cache_key!["todo", 1], || get_todo(1), opts.clone())
                .await
                .map(|t| t.title.len())
        });
    });

    // Stale entry: spawn, dedup bookkeeping, settle
    group.bench_function("fetch_query_miss", |b| {
        let client = QueryClient::new();
        let opts = QueryOptions::default().with_retry(0);

        b.to_async(&rt).iter(|| async {
            client
                .fetch_query(cache_key!["todo", 2], || get_todo(2), opts.clone())
                .await
                .map(|t| t.id)
        });
    });

    for observers in [1usize, 8, 64].iter() {
        group.bench_with_input(
            BenchmarkId::new("mount_and_settle", observers),
            observers,
            |b, &observers| {
                b.to_async(&rt).iter(|| async move {
                    let client = QueryClient::new();
                    let mut queries = Vec::with_capacity(observers);
                    for _ in 0..observers {
                        queries.push(
                            use_api_query(&client, cache_key!["todo", 3], || get_todo(3))
                                .expect("Failed to mount"),
                        );
                    }
                    for query in &mut queries {
                        black_box(query.settled().await);
                    }
                });
            },
        );
    }

    group.bench_function("set_then_get", |b| {
        let client = QueryClient::new();
        b.iter(|| {
            client.set_query_data(cache_key!["todo", 4], black_box(4u32));
            client.get_query_data::<u32>(cache_key!["todo", 4])
        });
    });

    group.finish();
}

// ============================================================================
// Group 3: Wrapped mutations
// ============================================================================

fn mutation_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutation");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    group.bench_function("mutate_async", |b| {
        let client = QueryClient::new();
        let mutation = use_api_mutation(&client, |id: u32| async move {
            Ok::<_, Error>(Envelope::<u32, String>::Ok(id))
        });

        b.to_async(&rt)
            .iter(|| async { mutation.mutate_async(black_box(5)).await });
    });

    group.finish();
}

criterion_group!(
    benches,
    baseline_benchmarks,
    query_benchmarks,
    mutation_benchmarks
);
criterion_main!(benches);
