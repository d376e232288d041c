use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use fleetops_core::{JobId, TargetSystem};
use fleetops_infra::cache::{CacheConfig, CacheKey, ClientCache};
use fleetops_infra::jobs::JobRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct BenchClient;

fn keys(n: u32) -> Vec<CacheKey> {
    (0..n)
        .map(|i| {
            CacheKey::fingerprint(TargetSystem::Packages, &format!("https://cluster-{i}:6443"))
                .expect("fingerprint")
        })
        .collect()
}

fn bench_cache_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_cache_hit");
    group.throughput(Throughput::Elements(1));

    for entries in [1u32, 16, 100] {
        let cache: ClientCache<BenchClient> =
            ClientCache::new(CacheConfig::default().with_capacity(entries as usize));
        let keys = keys(entries);
        for key in &keys {
            cache
                .get_or_create(key, || Ok::<_, ()>(Arc::new(BenchClient)))
                .expect("populate");
        }

        group.bench_with_input(BenchmarkId::from_parameter(entries), &keys, |b, keys| {
            let mut i = 0usize;
            b.iter(|| {
                let key = &keys[i % keys.len()];
                i += 1;
                black_box(cache.get_or_create(key, || Ok::<_, ()>(Arc::new(BenchClient))))
            });
        });
    }

    group.finish();
}

fn bench_cache_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_cache_eviction");
    let cache: ClientCache<BenchClient> =
        ClientCache::new(CacheConfig::default().with_capacity(100).without_ttl());
    let keys = keys(1000);

    // Every lookup misses and evicts once the cache is full.
    group.bench_function("miss_and_evict_at_capacity_100", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(cache.get_or_create(key, || Ok::<_, ()>(Arc::new(BenchClient))))
        });
    });

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let conn = fleetops_core::ConnectionConfig::new(TargetSystem::Packages, "https://k8s:6443")
        .with_context("prod")
        .with_namespace("apps")
        .with_setting("token", "x".repeat(512));

    c.bench_function("cache_key_fingerprint", |b| {
        b.iter(|| black_box(CacheKey::for_connection(black_box(&conn))))
    });
}

fn bench_registry_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_registry_add_log");

    for jobs in [1usize, 1000] {
        // Fresh registry per batch so log vectors stay short.
        let setup = || {
            let registry = JobRegistry::new();
            for i in 0..jobs {
                let id = JobId::from(format!("job-{i}"));
                registry.create(id.clone(), BTreeMap::new()).expect("create");
                registry.update_status(&id, 0, "running").expect("start");
            }
            registry
        };
        let target = JobId::from(format!("job-{}", jobs / 2));

        group.bench_with_input(BenchmarkId::from_parameter(jobs), &target, |b, id| {
            b.iter_batched_ref(
                setup,
                |registry| black_box(registry.add_log(id, "check 1: release status: not yet")),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_hits,
    bench_cache_eviction,
    bench_fingerprint,
    bench_registry_log_append
);
criterion_main!(benches);
