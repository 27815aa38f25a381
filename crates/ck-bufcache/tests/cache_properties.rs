//! Eviction-order and residency properties of the buffer cache, checked
//! with deterministic single-threaded schedules against an in-memory disk.

use ck_bufcache::{BufCache, CacheConfig, ExhaustionPolicy, MemDisk};
use ck_types::{BlockNumber, BlockSize, DeviceId};

const DEV: DeviceId = DeviceId(0);

fn cache(slots: usize, buckets: usize) -> BufCache<MemDisk> {
    let config = CacheConfig {
        slots,
        buckets,
        block_size: BlockSize::new(512).unwrap(),
        exhaustion: ExhaustionPolicy::Fatal,
    };
    BufCache::new(MemDisk::new(), config).unwrap()
}

#[test]
fn eviction_order_follows_release_order() {
    // One bucket, three slots. Release order 1, 0, 2 makes block 1's slot
    // the least recently released, so the next miss must take it.
    let cache = cache(3, 1);

    let h0 = cache.read(DEV, BlockNumber(0)).unwrap();
    let h1 = cache.read(DEV, BlockNumber(1)).unwrap();
    let h2 = cache.read(DEV, BlockNumber(2)).unwrap();
    drop(h1);
    drop(h0);
    drop(h2);

    drop(cache.read(DEV, BlockNumber(3)).unwrap());

    drop(cache.read(DEV, BlockNumber(0)).unwrap());
    drop(cache.read(DEV, BlockNumber(2)).unwrap());
    drop(cache.read(DEV, BlockNumber(1)).unwrap());

    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(0)), 1);
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(2)), 1);
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(1)), 2);
}

#[test]
fn miss_relocates_buffer_across_buckets_when_bucket_is_full() {
    // Two buckets, two slots each. Blocks hash by parity. Holding blocks 0
    // and 2 pins every slot of bucket 0, so a miss on block 4 must steal
    // the least recently released slot of bucket 1 (block 1's).
    let cache = cache(4, 2);

    let _h0 = cache.read(DEV, BlockNumber(0)).unwrap();
    let _h2 = cache.read(DEV, BlockNumber(2)).unwrap();
    drop(cache.read(DEV, BlockNumber(1)).unwrap());
    drop(cache.read(DEV, BlockNumber(3)).unwrap());

    let h4 = cache.read(DEV, BlockNumber(4)).unwrap();
    assert_eq!(h4.block(), BlockNumber(4));
    assert_eq!(cache.stats().cross_bucket_moves, 1);

    // Block 1 lost its buffer; block 3 kept its.
    drop(cache.read(DEV, BlockNumber(3)).unwrap());
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(3)), 1);
    drop(cache.read(DEV, BlockNumber(1)).unwrap());
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(1)), 2);
}

#[test]
fn pinned_buffer_survives_eviction_pressure() {
    let cache = cache(2, 1);

    let h0 = cache.read(DEV, BlockNumber(0)).unwrap();
    let pin = h0.pin();
    drop(h0);

    // Cycle other blocks through the remaining slot.
    drop(cache.read(DEV, BlockNumber(1)).unwrap());
    drop(cache.read(DEV, BlockNumber(2)).unwrap());
    drop(cache.read(DEV, BlockNumber(3)).unwrap());

    // Still resident: no refetch.
    drop(cache.read(DEV, BlockNumber(0)).unwrap());
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(0)), 1);

    pin.unpin();

    // Unpinned, it is evictable again.
    drop(cache.read(DEV, BlockNumber(4)).unwrap());
    drop(cache.read(DEV, BlockNumber(5)).unwrap());
    drop(cache.read(DEV, BlockNumber(0)).unwrap());
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(0)), 2);
}

#[test]
fn recoverable_exhaustion_is_repeatable() {
    let config = CacheConfig {
        slots: 2,
        buckets: 2,
        block_size: BlockSize::new(512).unwrap(),
        exhaustion: ExhaustionPolicy::Recoverable,
    };
    let cache = BufCache::new(MemDisk::new(), config).unwrap();

    for round in 0..3_u64 {
        let a = cache.get(DEV, BlockNumber(round * 10)).unwrap();
        let b = cache.get(DEV, BlockNumber(round * 10 + 1)).unwrap();
        assert!(cache.get(DEV, BlockNumber(round * 10 + 2)).is_err());
        drop(a);
        drop(b);
        // With slots free again, requests succeed.
        drop(cache.get(DEV, BlockNumber(round * 10 + 2)).unwrap());
    }
    assert_eq!(cache.referenced_slots(), 0);
}

#[test]
fn stats_account_for_every_request() {
    let cache = cache(4, 2);

    for i in 0..4_u64 {
        drop(cache.read(DEV, BlockNumber(i)).unwrap());
    }
    for i in 0..4_u64 {
        drop(cache.read(DEV, BlockNumber(i)).unwrap());
    }

    let stats = cache.stats();
    assert_eq!(stats.hits, 4);
    assert_eq!(stats.misses, 4);
    assert_eq!(stats.local_reclaims + stats.cross_bucket_moves, 4);
}

#[test]
fn rereading_a_held_block_shares_the_slot() {
    let cache = cache(4, 2);

    let pin = {
        let h = cache.read(DEV, BlockNumber(7)).unwrap();
        h.pin()
    };
    // The handle is gone but the pin holds the slot; a new read of the
    // same block must not fetch again.
    let h = cache.read(DEV, BlockNumber(7)).unwrap();
    assert_eq!(cache.driver().reads_for(DEV, BlockNumber(7)), 1);
    drop(h);
    pin.unpin();
    assert_eq!(cache.referenced_slots(), 0);
}
