//! Multi-threaded allocator invariants: no page handed out twice, balanced
//! refcounts after churn, and shared-page release ordering.

use std::sync::Barrier;
use std::thread;

use ck_pagealloc::{PageAlloc, PageAllocConfig};
use ck_types::{PageAddr, PageSize};

fn arena(pages: usize) -> PageAlloc {
    PageAlloc::new(PageAllocConfig {
        pages,
        page_size: PageSize::new(256).unwrap(),
        ..PageAllocConfig::default()
    })
    .unwrap()
}

#[test]
fn concurrent_allocs_never_share_a_page() {
    let alloc = arena(64);
    let threads = 8;
    let barrier = Barrier::new(threads);

    let mut claimed: Vec<PageAddr> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let mut mine = Vec::new();
                    while let Some(page) = alloc.alloc() {
                        mine.push(page);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(claimed.len(), 64);
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 64, "one page was allocated twice");
    assert_eq!(alloc.free_pages(), 0);

    for page in claimed {
        alloc.free(page).unwrap();
    }
    assert_eq!(alloc.free_pages(), 64);
}

#[test]
fn alloc_free_churn_stays_balanced() {
    let alloc = arena(16);
    let threads = 8;
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..500 {
                    // The pool can transiently run dry; both outcomes are
                    // legal, only imbalance is a bug.
                    if let Some(page) = alloc.alloc() {
                        alloc.free(page).unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(alloc.free_pages(), 16);
    assert_eq!(alloc.free_bytes(), 16 * 256);
}

#[test]
fn concurrent_shares_and_frees_balance_out() {
    let alloc = arena(4);
    let page = alloc.alloc().unwrap();
    let threads = 8;
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..100 {
                    alloc.share(page).unwrap();
                    alloc.free(page).unwrap();
                }
            });
        }
    });

    // All share/free pairs balanced; only the original reference remains.
    assert_eq!(alloc.refcount(page).unwrap(), 1);
    alloc.free(page).unwrap();
    assert_eq!(alloc.free_pages(), 4);
}
