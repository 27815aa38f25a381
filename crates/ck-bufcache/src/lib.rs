#![forbid(unsafe_code)]
//! Sharded block buffer cache.
//!
//! A fixed pool of block-sized buffers, partitioned into hash buckets by
//! block number so that lookups on different buckets never contend. Serves
//! cached disk blocks to callers, evicting the least-recently-released
//! unreferenced buffer on a miss, and falling back to a serialized
//! cross-bucket reclaim when the requesting bucket has no candidate.
//!
//! Interface:
//! * [`BufCache::read`] returns an exclusively-held [`BufHandle`] with the
//!   block's content loaded.
//! * [`BufHandle::write`] flushes the payload back to disk.
//! * Dropping the handle releases the buffer; do not keep handles longer
//!   than necessary — a held buffer cannot be evicted.
//! * [`BufHandle::pin`] keeps a buffer resident across handle lifetimes
//!   without claiming exclusive access.
//!
//! # Locking
//!
//! Per-bucket mutexes guard chain membership; a per-slot leaf mutex guards
//! identity and refcount; a per-slot payload mutex is the exclusive-access
//! (sleep) lock handed to callers inside the handle. Cross-bucket reclaims
//! are serialized by one dedicated mutex, acquired only while no bucket
//! lock is held.

pub mod driver;

pub use driver::{DiskDriver, FileDisk, MemDisk, TransferDir};

use ck_error::{CkError, FatalReason, Result};
use ck_types::{
    BlockNumber, BlockSize, ConfigError, DEFAULT_CACHE_BUCKETS, DEFAULT_CACHE_SLOTS, DeviceId, Tick,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// What `get` does when every buffer in the pool is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Report the kernel-fatal `Fatal(BufferCacheExhausted)` error. This is
    /// the default: exhaustion means more blocks are held concurrently than
    /// the cache has slots, which is a caller bug, not a runtime condition.
    #[default]
    Fatal,
    /// Report the recoverable `CacheExhausted` error instead, for callers
    /// (and tests) that choose to handle exhaustion themselves.
    Recoverable,
}

/// Buffer cache geometry and policy, fixed at construction.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total buffer slots in the pool.
    pub slots: usize,
    /// Number of hash buckets the pool is partitioned into.
    pub buckets: usize,
    /// Payload size of every slot.
    pub block_size: BlockSize,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_CACHE_SLOTS,
            buckets: DEFAULT_CACHE_BUCKETS,
            block_size: BlockSize::DEFAULT,
            exhaustion: ExhaustionPolicy::Fatal,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::InvalidField {
                field: "slots",
                reason: "must be > 0",
            });
        }
        if self.buckets == 0 {
            return Err(ConfigError::InvalidField {
                field: "buckets",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Counter snapshot for summary reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses served by evicting a buffer already in the requesting bucket.
    pub local_reclaims: u64,
    /// Misses served by relocating a buffer from another bucket.
    pub cross_bucket_moves: u64,
}

/// Stable index of a slot in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotId(usize);

/// Slot metadata, guarded by a leaf mutex.
///
/// Identity, refcount, and bucket ownership change only while the owning
/// bucket's lock is held and the mutating thread holds (or is taking) a
/// nonzero refcount.
#[derive(Debug)]
struct SlotMeta {
    /// `None` until the slot is first claimed for a block.
    ident: Option<(DeviceId, BlockNumber)>,
    refcnt: u32,
    /// Stamped when `refcnt` last reached zero; stale while referenced and
    /// never used to rank referenced slots.
    stamp: Tick,
    /// Index of the bucket whose chain currently holds this slot.
    owner: usize,
}

struct Slot {
    meta: Mutex<SlotMeta>,
    /// Whether the payload mirrors the on-disk block.
    valid: AtomicBool,
    /// Payload plus its exclusive-access lock. Held (inside the returned
    /// handle) for the whole time a caller uses the buffer.
    data: Mutex<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    local_reclaims: AtomicU64,
    cross_bucket_moves: AtomicU64,
}

/// Sharded LRU buffer cache over a [`DiskDriver`].
pub struct BufCache<D: DiskDriver> {
    driver: D,
    config: CacheConfig,
    slots: Vec<Slot>,
    buckets: Vec<Mutex<Vec<SlotId>>>,
    /// Bucket count widened once at construction for the block hash.
    bucket_count: u64,
    /// Serializes cross-bucket reclaims so two threads cannot claim the
    /// same victim. Never acquired while a bucket lock is held.
    reclaim: Mutex<()>,
    /// Logical clock for recency stamps.
    clock: AtomicU64,
    counters: StatCounters,
}

impl<D: DiskDriver> BufCache<D> {
    /// Build the pool: every slot starts invalid, unreferenced, and parked
    /// in bucket `index % buckets`.
    pub fn new(driver: D, config: CacheConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let slots: Vec<Slot> = (0..config.slots)
            .map(|i| Slot {
                meta: Mutex::new(SlotMeta {
                    ident: None,
                    refcnt: 0,
                    stamp: Tick::ZERO,
                    owner: i % config.buckets,
                }),
                valid: AtomicBool::new(false),
                data: Mutex::new(vec![0_u8; config.block_size.byte_len()].into_boxed_slice()),
            })
            .collect();

        let mut chains: Vec<Vec<SlotId>> = vec![Vec::new(); config.buckets];
        for i in 0..config.slots {
            chains[i % config.buckets].push(SlotId(i));
        }

        info!(
            slots = config.slots,
            buckets = config.buckets,
            block_size = config.block_size.get(),
            "bufcache: initialized"
        );

        Ok(Self {
            driver,
            bucket_count: config.buckets as u64,
            config,
            slots,
            buckets: chains.into_iter().map(Mutex::new).collect(),
            reclaim: Mutex::new(()),
            clock: AtomicU64::new(1),
            counters: StatCounters::default(),
        })
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.config.slots
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.config.buckets
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            local_reclaims: self.counters.local_reclaims.load(Ordering::Relaxed),
            cross_bucket_moves: self.counters.cross_bucket_moves.load(Ordering::Relaxed),
        }
    }

    /// Number of slots currently held via a handle or pin.
    #[must_use]
    pub fn referenced_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.meta.lock().refcnt > 0)
            .count()
    }

    /// Return an exclusively-held buffer for `(dev, block)`, allocating a
    /// slot on miss.
    ///
    /// The returned handle owns the buffer's exclusive-access lock; drop it
    /// to release the buffer. Fails only on pool exhaustion, per the
    /// configured [`ExhaustionPolicy`].
    pub fn get(&self, dev: DeviceId, block: BlockNumber) -> Result<BufHandle<'_, D>> {
        let idx = self.bucket_index(block);
        {
            let bucket = self.buckets[idx].lock();
            if let Some(id) = self.find_cached(&bucket, dev, block) {
                self.slots[id.0].meta.lock().refcnt += 1;
                drop(bucket);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.lock_payload(id, dev, block));
            }
            if let Some(id) = self.find_local_victim(&bucket) {
                self.claim(id, dev, block, idx);
                drop(bucket);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.local_reclaims.fetch_add(1, Ordering::Relaxed);
                trace!(dev = dev.0, block = block.0, "bufcache: local reclaim");
                return Ok(self.lock_payload(id, dev, block));
            }
        }
        // The bucket lock is dropped before taking the reclaim lock, so no
        // thread ever waits on the reclaim lock while holding a bucket lock.
        self.reclaim_into(idx, dev, block)
    }

    /// Return a locked buffer with the block's contents loaded.
    ///
    /// On a cold buffer this invokes the disk driver synchronously; for any
    /// set of concurrent requests of one block, exactly one caller performs
    /// the fill.
    pub fn read(&self, dev: DeviceId, block: BlockNumber) -> Result<BufHandle<'_, D>> {
        let mut buf = self.get(dev, block)?;
        if !buf.is_valid() {
            self.driver
                .transfer(dev, block, buf.data_mut(), TransferDir::Read);
            self.slots[buf.id.0].valid.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    /// Hash a block number to its bucket.
    ///
    /// The remainder is bounded by `bucket_count`, which originates from a
    /// `usize`, so the narrowing cast cannot truncate.
    #[allow(clippy::cast_possible_truncation)]
    fn bucket_index(&self, block: BlockNumber) -> usize {
        (block.0 % self.bucket_count) as usize
    }

    fn find_cached(&self, chain: &[SlotId], dev: DeviceId, block: BlockNumber) -> Option<SlotId> {
        chain
            .iter()
            .copied()
            .find(|id| self.slots[id.0].meta.lock().ident == Some((dev, block)))
    }

    /// Least-recently-released unreferenced slot in one bucket's chain.
    fn find_local_victim(&self, chain: &[SlotId]) -> Option<SlotId> {
        let mut best: Option<(SlotId, Tick)> = None;
        for id in chain.iter().copied() {
            let meta = self.slots[id.0].meta.lock();
            if meta.refcnt == 0 && best.map_or(true, |(_, stamp)| meta.stamp < stamp) {
                best = Some((id, meta.stamp));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Unlocked scan over the whole pool for the globally
    /// least-recently-released unreferenced slot.
    ///
    /// Slots owned by `requesting` are skipped: the caller holds that
    /// bucket's lock and has already scanned its chain, and no slot can
    /// join or leave it while the lock is held.
    fn global_victim(&self, requesting: usize) -> Option<(SlotId, usize)> {
        let mut best: Option<(SlotId, usize, Tick)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let meta = slot.meta.lock();
            if meta.refcnt != 0 || meta.owner == requesting {
                continue;
            }
            if best.map_or(true, |(_, _, stamp)| meta.stamp < stamp) {
                best = Some((SlotId(i), meta.owner, meta.stamp));
            }
        }
        best.map(|(id, owner, _)| (id, owner))
    }

    /// Set a new identity on an unreferenced slot. Caller holds the owning
    /// bucket's lock.
    fn claim(&self, id: SlotId, dev: DeviceId, block: BlockNumber, owner: usize) {
        let slot = &self.slots[id.0];
        let mut meta = slot.meta.lock();
        debug_assert_eq!(meta.refcnt, 0, "claimed a referenced slot");
        meta.ident = Some((dev, block));
        meta.refcnt = 1;
        meta.owner = owner;
        drop(meta);
        slot.valid.store(false, Ordering::Release);
    }

    /// Serve a miss whose bucket has no unreferenced slot by stealing the
    /// globally least-recently-released one from another bucket.
    fn reclaim_into(&self, idx: usize, dev: DeviceId, block: BlockNumber) -> Result<BufHandle<'_, D>> {
        let serial = self.reclaim.lock();
        let id = loop {
            let mut bucket = self.buckets[idx].lock();

            // Another thread may have cached this block, or released a
            // local slot, while we waited for the reclaim lock.
            if let Some(id) = self.find_cached(&bucket, dev, block) {
                self.slots[id.0].meta.lock().refcnt += 1;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                break id;
            }
            if let Some(id) = self.find_local_victim(&bucket) {
                self.claim(id, dev, block, idx);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.local_reclaims.fetch_add(1, Ordering::Relaxed);
                break id;
            }

            let Some((victim, origin)) = self.global_victim(idx) else {
                return Err(match self.config.exhaustion {
                    ExhaustionPolicy::Fatal => CkError::Fatal(FatalReason::BufferCacheExhausted),
                    ExhaustionPolicy::Recoverable => CkError::CacheExhausted,
                });
            };

            // Verify under the origin bucket's lock: the victim may have
            // been re-referenced or relocated since the unlocked scan.
            let mut origin_bucket = self.buckets[origin].lock();
            let slot = &self.slots[victim.0];
            let mut meta = slot.meta.lock();
            if meta.refcnt != 0 || meta.owner != origin {
                drop(meta);
                drop(origin_bucket);
                drop(bucket);
                continue;
            }
            let evicted = meta.ident;
            meta.ident = Some((dev, block));
            meta.refcnt = 1;
            meta.owner = idx;
            drop(meta);
            slot.valid.store(false, Ordering::Release);
            origin_bucket.retain(|s| *s != victim);
            drop(origin_bucket);
            bucket.push(victim);

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.cross_bucket_moves.fetch_add(1, Ordering::Relaxed);
            debug!(
                dev = dev.0,
                block = block.0,
                from_bucket = origin,
                to_bucket = idx,
                evicted_block = evicted.map(|(_, b)| b.0),
                "bufcache: cross-bucket reclaim"
            );
            break victim;
        };
        // Release the reclaim lock before blocking on the payload lock: a
        // thread holding a payload can itself need a reclaim to progress.
        drop(serial);
        Ok(self.lock_payload(id, dev, block))
    }

    fn lock_payload(&self, id: SlotId, dev: DeviceId, block: BlockNumber) -> BufHandle<'_, D> {
        let data = self.slots[id.0].data.lock();
        BufHandle {
            cache: self,
            id,
            dev,
            block,
            data: Some(data),
        }
    }

    /// Take an extra reference on a slot, keeping it resident.
    fn pin_slot(&self, id: SlotId, block: BlockNumber) -> BufPin<'_, D> {
        let _bucket = self.buckets[self.bucket_index(block)].lock();
        self.slots[id.0].meta.lock().refcnt += 1;
        BufPin {
            cache: self,
            id,
            block,
        }
    }

    /// Drop one reference; on the transition to zero, stamp the recency
    /// clock so the slot joins the eviction candidates.
    fn release_slot(&self, id: SlotId, block: BlockNumber) {
        let _bucket = self.buckets[self.bucket_index(block)].lock();
        let mut meta = self.slots[id.0].meta.lock();
        debug_assert!(meta.refcnt > 0, "released an unreferenced slot");
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            meta.stamp = Tick(self.clock.fetch_add(1, Ordering::Relaxed));
        }
    }
}

impl<D: DiskDriver> std::fmt::Debug for BufCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("slots", &self.config.slots)
            .field("buckets", &self.config.buckets)
            .finish_non_exhaustive()
    }
}

/// Exclusively-held buffer.
///
/// Owns the slot's payload lock for its whole lifetime; dropping the handle
/// releases the lock and then the reference, on every exit path.
pub struct BufHandle<'a, D: DiskDriver> {
    cache: &'a BufCache<D>,
    id: SlotId,
    dev: DeviceId,
    block: BlockNumber,
    /// `Some` until `Drop`; the guard must go before the refcount does.
    data: Option<MutexGuard<'a, Box<[u8]>>>,
}

impl<'a, D: DiskDriver> BufHandle<'a, D> {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.dev
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Whether the payload mirrors the on-disk block.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cache.slots[self.id.0].valid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data
            .as_ref()
            .expect("payload guard held for the handle's lifetime")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
            .as_mut()
            .expect("payload guard held for the handle's lifetime")
    }

    /// Flush the payload to disk.
    ///
    /// Exclusive access is guaranteed by construction: only the handle that
    /// owns the payload lock can call this.
    pub fn write(&mut self) {
        let dev = self.dev;
        let block = self.block;
        let data = self
            .data
            .as_mut()
            .expect("payload guard held for the handle's lifetime");
        self.cache.driver.transfer(dev, block, data, TransferDir::Write);
    }

    /// Keep the buffer resident past this handle's release, without holding
    /// exclusive access. Used by callers that need a block to survive
    /// multiple lock/release cycles by other holders.
    #[must_use]
    pub fn pin(&self) -> BufPin<'a, D> {
        self.cache.pin_slot(self.id, self.block)
    }
}

impl<D: DiskDriver> Drop for BufHandle<'_, D> {
    fn drop(&mut self) {
        // Exclusive access ends before the refcount drops, so a slot with
        // refcnt == 0 never has an outstanding payload guard.
        self.data.take();
        self.cache.release_slot(self.id, self.block);
    }
}

impl<D: DiskDriver> std::fmt::Debug for BufHandle<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufHandle")
            .field("dev", &self.dev)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

/// A residency reference on a buffer, without exclusive access.
///
/// Dropping the pin (or calling [`BufPin::unpin`]) releases the reference.
pub struct BufPin<'a, D: DiskDriver> {
    cache: &'a BufCache<D>,
    id: SlotId,
    block: BlockNumber,
}

impl<D: DiskDriver> BufPin<'_, D> {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Release the residency reference.
    pub fn unpin(self) {}
}

impl<D: DiskDriver> Drop for BufPin<'_, D> {
    fn drop(&mut self) {
        self.cache.release_slot(self.id, self.block);
    }
}

impl<D: DiskDriver> std::fmt::Debug for BufPin<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufPin").field("block", &self.block).finish_non_exhaustive()
    }
}
