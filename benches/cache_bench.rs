//! Benchmarks for the local cache tier.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kv_cache_offload::cache::policy::{CacheTable, Evictable};
use kv_cache_offload::cache::{CachePolicyKind, LocalCpuBackend, StorageBackend};
use kv_cache_offload::config::EngineConfig;
use kv_cache_offload::key::CacheEngineKey;
use kv_cache_offload::memory::{DType, MemoryFormat, PagedAllocator};

const PAGE: usize = 4096;
const SHAPE: [usize; 3] = [2, 32, 32];

fn key(hash: i64) -> CacheEngineKey {
    CacheEngineKey::new("vllm", "llama-3-8b", 8, 3, hash).unwrap()
}

fn bench_key_codec(c: &mut Criterion) {
    let k = key(0x5eed_cafe)
        .with_tags([("lora", "adapter-7"), ("tenant", "a")])
        .unwrap();
    let s = k.to_string();

    c.bench_function("key_to_string", |b| b.iter(|| black_box(&k).to_string()));
    c.bench_function("key_from_string", |b| {
        b.iter(|| CacheEngineKey::from_string(black_box(&s)))
    });
    c.bench_function("key_split_32_layers", |b| {
        b.iter(|| black_box(&k).split_layers(32))
    });
}

struct Slot {
    pinned: bool,
}

impl Evictable for Slot {
    fn can_evict(&self) -> bool {
        !self.pinned
    }
}

fn bench_policy_candidates(c: &mut Criterion) {
    for kind in [CachePolicyKind::Lru, CachePolicyKind::Lfu] {
        let mut policy = kind.build::<Slot>();
        let mut table: CacheTable<Slot> = policy.init_table();
        // Every tenth entry is pinned.
        for i in 0..10_000 {
            let k = key(i);
            policy.update_on_put(&k);
            table.put(k, Slot { pinned: i % 10 == 0 });
        }
        for i in (0..10_000).step_by(3) {
            policy.update_on_hit(&key(i), &mut table);
        }

        c.bench_function(&format!("{}_candidates_100_of_10k", policy.name()), |b| {
            b.iter(|| policy.get_evict_candidates(black_box(&table), 100))
        });
    }
}

fn bench_backend_churn(c: &mut Criterion) {
    let alloc = Arc::new(PagedAllocator::new(1024 * PAGE, PAGE));
    let backend = LocalCpuBackend::new(&EngineConfig::default(), alloc);
    let fmt = Some(MemoryFormat::Kv2Td);

    // Fill once so every iteration below has to evict.
    let mut next = 0i64;
    while let Some(obj) = backend.allocate(&SHAPE, DType::Half, fmt, false) {
        backend.submit_put(key(next), &obj);
        next += 1;
    }

    c.bench_function("backend_allocate_with_eviction", |b| {
        b.iter(|| {
            if let Some(obj) = backend.allocate(&SHAPE, DType::Half, fmt, true) {
                backend.submit_put(key(next), &obj);
                next += 1;
            }
        })
    });

    c.bench_function("backend_lookup_hit", |b| {
        let hot = key(next - 1);
        b.iter(|| {
            let found = backend.contains(black_box(&hot), false);
            black_box(found);
            backend.get_blocking(&hot)
        })
    });
}

criterion_group!(
    benches,
    bench_key_codec,
    bench_policy_candidates,
    bench_backend_churn
);
criterion_main!(benches);
