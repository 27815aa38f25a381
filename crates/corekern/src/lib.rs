#![forbid(unsafe_code)]
//! Corekern public API facade.
//!
//! Re-exports the resource layer's two subsystems through one crate: the
//! sharded block buffer cache (`ck-bufcache`) and the reference-counted
//! physical page allocator (`ck-pagealloc`), plus the shared identifier
//! types and error taxonomy. This is the crate downstream consumers
//! depend on.

pub use ck_bufcache::{
    BufCache, BufHandle, BufPin, CacheConfig, CacheStats, DiskDriver, ExhaustionPolicy, FileDisk,
    MemDisk, TransferDir,
};
pub use ck_error::{CkError, FatalReason, Result};
pub use ck_pagealloc::{
    ALLOC_SCRUB, FREE_SCRUB, MemSummary, PageAlloc, PageAllocConfig, RefcountTable,
};
pub use ck_types::{
    BlockNumber, BlockSize, ConfigError, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BUCKETS,
    DEFAULT_CACHE_SLOTS, DEFAULT_PAGE_BASE, DEFAULT_PAGE_COUNT, DEFAULT_PAGE_SIZE, DeviceId,
    PageAddr, PageSize, Tick,
};

#[cfg(test)]
mod tests {
    use super::*;

    // Smoke test across the whole facade: allocate a page to back a block
    // payload copy, read it through the cache, and release everything.
    #[test]
    fn cache_and_allocator_compose() {
        let disk = MemDisk::new();
        disk.preload(DeviceId(0), BlockNumber(1), &[3_u8; 1024]);
        let cache = BufCache::new(disk, CacheConfig::default()).unwrap();
        let alloc = PageAlloc::new(PageAllocConfig::default()).unwrap();

        let page = alloc.alloc().unwrap();
        {
            let buf = cache.read(DeviceId(0), BlockNumber(1)).unwrap();
            alloc
                .with_page(page, |bytes| {
                    bytes[..buf.data().len()].copy_from_slice(buf.data());
                })
                .unwrap();
        }
        alloc
            .with_page(page, |bytes| assert_eq!(bytes[..1024], [3_u8; 1024]))
            .unwrap();

        alloc.free(page).unwrap();
        assert_eq!(alloc.free_pages(), alloc.total_pages());
        assert_eq!(cache.referenced_slots(), 0);
    }
}
