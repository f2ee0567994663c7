//! Performance benchmarks for query-kit
//!
//! This benchmark suite measures:
//! - Key serialization (structured and fallback)
//! - Cache store operations (set, get, notify, eviction, invalidate)
//! - Query client paths (fresh hit, owned fetch, deduplicated fan-in)
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use query_kit::store::{CacheStore, EntryUpdate, QueryStatus};
use query_kit::{query_key, FetchError, QueryClient, QueryKey, QueryOptions};
use rand::Rng;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Group 1: Key Codec Benchmarks
// ============================================================================

fn key_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_codec");

    for len in [1, 4, 16].iter() {
        group
            .throughput(Throughput::Elements(*len as u64))
            .bench_with_input(BenchmarkId::new("serialize", len), len, |b, &len| {
                let key = (0..len).fold(QueryKey::new(), |key, i| key.with(i));
                b.iter(|| black_box(&key).to_cache_key());
            });
    }

    group.bench_function("serialize_fallback", |b| {
        let mut key = query_key!["repo", 42];
        key.push_opaque("handle");
        b.iter(|| black_box(&key).to_cache_key());
    });

    group.bench_function("prefix_match", |b| {
        let parent = query_key!["repo"];
        let child = query_key!["repo", "r1", "issues", 7].to_cache_key();
        b.iter(|| parent.matches(black_box(&child)));
    });

    group.finish();
}

// ============================================================================
// Group 2: Cache Store Benchmarks
// ============================================================================

fn store_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_store");

    group.bench_function("set", |b| {
        let store = CacheStore::new();
        b.iter(|| {
            store.set(
                black_box("bench_key"),
                EntryUpdate::new().data(1_u64).status(QueryStatus::Success),
            )
        });
    });

    group.bench_function("get_hit", |b| {
        let store = CacheStore::new();
        store.set("bench_key", EntryUpdate::new().data(1_u64));
        b.iter(|| store.get(black_box("bench_key")));
    });

    group.bench_function("get_random", |b| {
        let store = CacheStore::new();
        let keys: Vec<String> = (0..store.config().max_entries)
            .map(|i| query_key!["item", i].to_cache_key())
            .collect();
        for key in &keys {
            store.set(key, EntryUpdate::new().data(1_u64));
        }
        let mut rng = rand::rng();
        b.iter(|| store.get(black_box(&keys[rng.random_range(0..keys.len())])));
    });

    group.bench_function("get_miss", |b| {
        let store = CacheStore::new();
        b.iter(|| store.get(black_box("nonexistent_key")));
    });

    for subscribers in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("notify", subscribers),
            subscribers,
            |b, &subscribers| {
                let store = CacheStore::new();
                let hits = Arc::new(AtomicUsize::new(0));
                let _subscriptions: Vec<_> = (0..subscribers)
                    .map(|_| {
                        let hits = hits.clone();
                        store.subscribe("bench_key", move |_| {
                            hits.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();
                b.iter(|| store.notify(black_box("bench_key")));
            },
        );
    }

    // Eviction scan over a full store
    group.bench_function("set_at_capacity", |b| {
        let store = CacheStore::new();
        for i in 0..store.config().max_entries {
            store.set(&format!("seed_{}", i), EntryUpdate::new());
        }
        let mut next = 0_u64;
        b.iter(|| {
            next += 1;
            store.set(&format!("bench_{}", next), EntryUpdate::new());
        });
    });

    group.bench_function("invalidate_prefix", |b| {
        let store = CacheStore::new();
        for i in 0..50 {
            store.set(
                &query_key!["repo", i].to_cache_key(),
                EntryUpdate::new().status(QueryStatus::Success),
            );
        }
        b.iter(|| store.invalidate(Some(black_box(r#"["repo""#))));
    });

    group.finish();
}

// ============================================================================
// Group 3: Query Client Benchmarks
// ============================================================================

fn client_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_client");

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    // Fresh cache hit, the fetch function is never called
    group.bench_function("query_hit", |b| {
        let client = QueryClient::new();
        let key = query_key!["bench", "hit"];
        let options = QueryOptions::default();
        rt.block_on(async {
            client
                .fetch(&key, |_| async { Ok::<_, FetchError>(1_u64) }, &options)
                .await
                .expect("Failed to seed");
        });

        b.to_async(&rt).iter(|| async {
            client
                .query(&key, |_| async { Ok::<_, FetchError>(2_u64) }, &options)
                .await
        });
    });

    // Owned fetch: claim, run, settle
    group.bench_function("fetch_owned", |b| {
        let client = QueryClient::new();
        let key = query_key!["bench", "owned"];
        let options = QueryOptions::default();

        b.to_async(&rt).iter(|| async {
            client
                .fetch(&key, |_| async { Ok::<_, FetchError>(1_u64) }, &options)
                .await
        });
    });

    // Fan-in of concurrent callers onto one attempt
    for callers in [2, 8, 32].iter() {
        group.bench_with_input(
            BenchmarkId::new("fetch_dedup", callers),
            callers,
            |b, &callers| {
                let client = QueryClient::new();
                let key = query_key!["bench", "dedup"];
                let options = QueryOptions::default();

                b.to_async(&rt).iter(|| async {
                    let fetches = (0..callers).map(|_| {
                        client.fetch(
                            &key,
                            |_| async {
                                tokio::task::yield_now().await;
                                Ok::<_, FetchError>(1_u64)
                            },
                            &options,
                        )
                    });
                    futures::future::join_all(fetches).await
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, key_benchmarks, store_benchmarks, client_benchmarks);
criterion_main!(benches);
