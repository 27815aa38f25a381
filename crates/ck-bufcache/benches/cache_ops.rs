#![forbid(unsafe_code)]

use ck_bufcache::{BufCache, CacheConfig, ExhaustionPolicy, MemDisk};
use ck_types::{BlockNumber, BlockSize, DeviceId};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

const DEV: DeviceId = DeviceId(0);

fn make_cache(slots: usize, buckets: usize) -> BufCache<MemDisk> {
    let config = CacheConfig {
        slots,
        buckets,
        block_size: BlockSize::new(1024).expect("block size"),
        exhaustion: ExhaustionPolicy::Fatal,
    };
    BufCache::new(MemDisk::new(), config).expect("cache")
}

fn bench_cached_read(c: &mut Criterion) {
    let cache = make_cache(30, 13);

    // Warm up: one miss, then benchmark repeated hits on the same block.
    drop(cache.read(DEV, BlockNumber(0)).expect("warmup"));

    c.bench_function("bufcache_hit_1k", |b| {
        b.iter(|| {
            let buf = cache.read(DEV, black_box(BlockNumber(0))).expect("hit");
            black_box(buf.data()[0]);
        });
    });
}

fn bench_local_reclaim(c: &mut Criterion) {
    // One bucket, one slot: every distinct block evicts the previous one
    // without leaving the bucket.
    let cache = make_cache(1, 1);

    let mut block = 0_u64;
    c.bench_function("bufcache_local_reclaim_1k", |b| {
        b.iter(|| {
            drop(cache.read(DEV, BlockNumber(block % 256)).expect("miss"));
            block += 1;
        });
    });
}

fn bench_mixed_workload(c: &mut Criterion) {
    // 30-slot pool with a 60-block working set for an even hit/miss mix.
    let cache = make_cache(30, 13);
    for i in 0..60_u64 {
        drop(cache.read(DEV, BlockNumber(i)).expect("warmup"));
    }

    let mut iter = 0_u64;
    c.bench_function("bufcache_mixed_1k", |b| {
        b.iter(|| {
            let block = BlockNumber(iter * 7 % 60);
            drop(cache.read(DEV, black_box(block)).expect("read"));
            iter += 1;
        });
    });
}

fn bench_stats_snapshot(c: &mut Criterion) {
    let cache = make_cache(30, 13);
    for i in 0..30_u64 {
        drop(cache.read(DEV, BlockNumber(i)).expect("warmup"));
    }

    c.bench_function("bufcache_stats_snapshot", |b| {
        b.iter(|| {
            let _stats = cache.stats();
        });
    });
}

criterion_group!(
    cache_benches,
    bench_cached_read,
    bench_local_reclaim,
    bench_mixed_workload,
    bench_stats_snapshot,
);
criterion_main!(cache_benches);
