#![forbid(unsafe_code)]
//! Reference-counted physical page allocator.
//!
//! A fixed arena of page frames tracked by two independent structures: a
//! singly-linked free list whose links live inside the free pages
//! themselves, and a parallel reference-count table that lets several
//! owners share one page (copy-on-write). Each structure has its own lock;
//! they are taken sequentially, never nested.
//!
//! Pages are identified by [`PageAddr`], a physical address within the
//! configured range. Every address crossing the API is validated for
//! alignment and range; a bad address is a caller bug and reported as a
//! kernel-fatal error, never a soft failure. Exhaustion, by contrast, is
//! ordinary: [`PageAlloc::alloc`] returns `None` and the caller decides.
//!
//! Freed pages are scrubbed with [`FREE_SCRUB`] and fresh allocations with
//! [`ALLOC_SCRUB`], so a caller that touches memory it no longer owns reads
//! a recognizable pattern instead of stale data.

use ck_error::{CkError, FatalReason, Result};
use ck_types::{ConfigError, DEFAULT_PAGE_BASE, DEFAULT_PAGE_COUNT, PageAddr, PageSize};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

/// Byte pattern written over a page when it is handed to a caller.
pub const ALLOC_SCRUB: u8 = 0x05;

/// Byte pattern written over a page when it returns to the free list.
pub const FREE_SCRUB: u8 = 0x01;

/// In-page free-list terminator.
const LINK_END: u32 = u32::MAX;

/// Allocator geometry, fixed at construction.
#[derive(Debug, Clone)]
pub struct PageAllocConfig {
    /// Number of page frames in the arena.
    pub pages: usize,
    pub page_size: PageSize,
    /// Physical address of the first frame.
    pub base: PageAddr,
}

impl Default for PageAllocConfig {
    fn default() -> Self {
        Self {
            pages: DEFAULT_PAGE_COUNT,
            page_size: PageSize::DEFAULT,
            base: PageAddr(DEFAULT_PAGE_BASE),
        }
    }
}

impl PageAllocConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.pages == 0 {
            return Err(ConfigError::InvalidField {
                field: "pages",
                reason: "must be > 0",
            });
        }
        // Free-list links are u32 arena indices; LINK_END is reserved.
        if self.pages >= LINK_END as usize {
            return Err(ConfigError::InvalidField {
                field: "pages",
                reason: "exceeds the free-list index width",
            });
        }
        if !self.base.is_aligned(self.page_size) {
            return Err(ConfigError::InvalidField {
                field: "base",
                reason: "must be page-aligned",
            });
        }
        let span = (self.pages as u64).checked_mul(u64::from(self.page_size.get()));
        if span.and_then(|s| self.base.checked_add(s)).is_none() {
            return Err(ConfigError::InvalidField {
                field: "pages",
                reason: "range overflows the address space",
            });
        }
        Ok(())
    }
}

/// Per-page owner counts, guarded by the allocator's refcount lock.
///
/// Opaque outside this crate; obtained via [`PageAlloc::refcounts`] and
/// passed back to [`PageAlloc::alloc_locked`] by callers that batch
/// refcount work under one acquisition.
#[derive(Debug)]
pub struct RefcountTable {
    counts: Vec<u32>,
}

impl RefcountTable {
    fn get(&self, index: usize) -> u32 {
        self.counts[index]
    }

    fn set(&mut self, index: usize, count: u32) {
        self.counts[index] = count;
    }
}

#[derive(Debug)]
struct FreeList {
    /// Arena index of the first free page, or [`LINK_END`].
    head: u32,
    len: usize,
}

/// Read-only memory summary record, filled in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSummary {
    pub free_bytes: u64,
    pub free_pages: usize,
    pub total_pages: usize,
    pub page_size: u32,
}

/// Fixed-arena page allocator with copy-on-write reference counts.
pub struct PageAlloc {
    config: PageAllocConfig,
    /// Frame storage. A free frame's first four bytes hold its successor's
    /// arena index, little-endian; the rest is [`FREE_SCRUB`].
    frames: Vec<Mutex<Box<[u8]>>>,
    free: Mutex<FreeList>,
    refcounts: Mutex<RefcountTable>,
}

impl PageAlloc {
    /// Build the arena with every page free, scrubbed, and linked onto the
    /// free list.
    pub fn new(config: PageAllocConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let page_bytes = config.page_size.byte_len();
        let mut frames = Vec::with_capacity(config.pages);
        for i in 0..config.pages {
            let mut frame = vec![FREE_SCRUB; page_bytes].into_boxed_slice();
            // Earlier frames link to later ones; the last terminates.
            let next = if i + 1 < config.pages {
                u32::try_from(i + 1).expect("arena index must fit in u32")
            } else {
                LINK_END
            };
            frame[..4].copy_from_slice(&next.to_le_bytes());
            frames.push(Mutex::new(frame));
        }

        info!(
            pages = config.pages,
            page_size = config.page_size.get(),
            base = config.base.0,
            "pagealloc: initialized"
        );

        Ok(Self {
            frames,
            free: Mutex::new(FreeList {
                head: 0,
                len: config.pages,
            }),
            refcounts: Mutex::new(RefcountTable {
                counts: vec![0; config.pages],
            }),
            config,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.config.page_size
    }

    #[must_use]
    pub fn base(&self) -> PageAddr {
        self.config.base
    }

    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.config.pages
    }

    /// Pages currently on the free list.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free.lock().len
    }

    /// Free memory in bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.lock().len as u64 * u64::from(self.config.page_size.get())
    }

    /// Fill the caller's summary record in place.
    pub fn fill_summary(&self, summary: &mut MemSummary) {
        let free = self.free.lock().len;
        summary.free_pages = free;
        summary.free_bytes = free as u64 * u64::from(self.config.page_size.get());
        summary.total_pages = self.config.pages;
        summary.page_size = self.config.page_size.get();
    }

    /// Allocate one page, or `None` when the free list is empty.
    ///
    /// The returned page is scrubbed with [`ALLOC_SCRUB`] and has reference
    /// count 1.
    pub fn alloc(&self) -> Option<PageAddr> {
        let mut refcounts = self.refcounts.lock();
        self.alloc_locked(&mut refcounts)
    }

    /// Allocate while the caller already holds the refcount table.
    ///
    /// Identical to [`PageAlloc::alloc`] except that the refcount lock is
    /// not taken here; the caller supplies the guard's contents, so
    /// re-acquisition is impossible by construction.
    pub fn alloc_locked(&self, refcounts: &mut RefcountTable) -> Option<PageAddr> {
        let index = {
            let mut free = self.free.lock();
            if free.head == LINK_END {
                return None;
            }
            let index = free.head as usize;
            let frame = self.frames[index].lock();
            free.head = u32::from_le_bytes(
                frame[..4].try_into().expect("frame holds at least 4 bytes"),
            );
            free.len -= 1;
            index
        };

        self.frames[index].lock().fill(ALLOC_SCRUB);
        refcounts.set(index, 1);
        let addr = self.addr_of(index);
        trace!(addr = addr.0, "pagealloc: alloc");
        Some(addr)
    }

    /// Drop one ownership reference to `addr`.
    ///
    /// A shared page (count > 1) is just decremented. The last reference
    /// scrubs the page with [`FREE_SCRUB`] and pushes it back onto the free
    /// list. Freeing a page that is already free is fatal.
    pub fn free(&self, addr: PageAddr) -> Result<()> {
        let index = self.index_of(addr)?;

        {
            let mut refcounts = self.refcounts.lock();
            match refcounts.get(index) {
                0 => return Err(CkError::Fatal(FatalReason::DoubleFreedPage { addr: addr.0 })),
                1 => refcounts.set(index, 0),
                count => {
                    refcounts.set(index, count - 1);
                    trace!(addr = addr.0, refcount = count - 1, "pagealloc: unshare");
                    return Ok(());
                }
            }
        }

        // Last owner gone. The page is in neither the free list nor the
        // refcount table now, so no other thread can reach it.
        let mut free = self.free.lock();
        let mut frame = self.frames[index].lock();
        frame.fill(FREE_SCRUB);
        frame[..4].copy_from_slice(&free.head.to_le_bytes());
        drop(frame);
        free.head = u32::try_from(index).expect("arena index must fit in u32");
        free.len += 1;
        drop(free);
        trace!(addr = addr.0, "pagealloc: free");
        Ok(())
    }

    /// Add an ownership reference to an allocated page (copy-on-write
    /// fork). Fatal if the page is currently free.
    pub fn share(&self, addr: PageAddr) -> Result<()> {
        let index = self.index_of(addr)?;
        let mut refcounts = self.refcounts.lock();
        let count = refcounts.get(index);
        if count == 0 {
            return Err(CkError::Fatal(FatalReason::FreePageShared { addr: addr.0 }));
        }
        refcounts.set(index, count + 1);
        trace!(addr = addr.0, refcount = count + 1, "pagealloc: share");
        Ok(())
    }

    /// Current reference count of `addr`.
    pub fn refcount(&self, addr: PageAddr) -> Result<u32> {
        let index = self.index_of(addr)?;
        Ok(self.refcounts.lock().get(index))
    }

    /// Force a page's reference count, for initializing kernel-reserved
    /// pages outside the normal allocate path.
    pub fn set_refcount(&self, addr: PageAddr, count: u32) -> Result<()> {
        let index = self.index_of(addr)?;
        self.refcounts.lock().set(index, count);
        Ok(())
    }

    /// Lock and return the whole refcount table, for callers that batch
    /// refcount work and lock-elided allocation ([`PageAlloc::alloc_locked`]).
    pub fn refcounts(&self) -> MutexGuard<'_, RefcountTable> {
        self.refcounts.lock()
    }

    /// Run `f` over the page's bytes under its frame lock.
    ///
    /// The memory-management layer uses this for copy-on-write copies;
    /// meaningful only for allocated pages (a free page's content is the
    /// scrub pattern plus the free-list link).
    pub fn with_page<R>(&self, addr: PageAddr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let index = self.index_of(addr)?;
        let mut frame = self.frames[index].lock();
        Ok(f(&mut frame))
    }

    /// Map an address to its arena index, validating alignment and range.
    fn index_of(&self, addr: PageAddr) -> Result<usize> {
        if !addr.is_aligned(self.config.page_size) {
            return Err(CkError::Fatal(FatalReason::MisalignedPage { addr: addr.0 }));
        }
        let page_bytes = u64::from(self.config.page_size.get());
        let index = addr
            .0
            .checked_sub(self.config.base.0)
            .map(|off| off / page_bytes)
            .filter(|&i| i < self.config.pages as u64)
            .ok_or(CkError::Fatal(FatalReason::PageOutOfRange { addr: addr.0 }))?;
        Ok(usize::try_from(index).expect("page index must fit in usize"))
    }

    fn addr_of(&self, index: usize) -> PageAddr {
        PageAddr(self.config.base.0 + index as u64 * u64::from(self.config.page_size.get()))
    }
}

impl std::fmt::Debug for PageAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAlloc")
            .field("pages", &self.config.pages)
            .field("page_size", &self.config.page_size.get())
            .field("base", &self.config.base)
            .finish_non_exhaustive()
    }
}
