#![allow(missing_docs)]

use contract_sync_cache::{CacheConfig, CacheStore};
use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn full_cache(entries: usize) -> CacheStore<String> {
    let cache = CacheStore::with_sizer(
        CacheConfig {
            max_total_bytes: u64::MAX,
            max_entries: entries,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 60_000,
        },
        String::len,
    );
    for idx in 0..entries {
        cache.set(format!("contracts:{idx}"), format!("payload-{idx}"));
    }
    cache
}

fn set_with_eviction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_set_with_eviction");
    for &entries in &[64usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(entries), &entries, |b, &entries| {
            b.iter_batched(
                || full_cache(entries),
                |cache| {
                    black_box(cache.set("contracts:incoming", "payload".to_owned()));
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, set_with_eviction_benchmark);
criterion_main!(benches);
