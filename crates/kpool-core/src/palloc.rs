//! Physical page pool.
//!
//! A fixed set of page frames partitioned into per-shard LIFO free stacks,
//! one shard per execution context (typically per core). Reference counts
//! live in a small set of striped locks independent of the shard locks, so
//! copy-on-write refcount traffic never contends with allocation.
//!
//! State machine per page: `Free(shard s)` → [`PageAllocator::allocate`] →
//! `Busy(refcount 1)` → [`PageAllocator::add_reference`] ±n → refcount
//! reaches 0 via [`PageAllocator::free`] → `Free(shard = freer's shard)`.
//! A page is never in two states at once: refcount 0 means it sits on
//! exactly one free stack, nonzero means it sits on none.
//!
//! Exhaustion is an ordinary, recoverable failure returned to the caller;
//! a double free or a refcount underflow is fatal.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::Exhausted;

/// Default page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Byte written over a page's contents on allocation, so reads of
/// uninitialized memory are detectable.
pub const ALLOC_PATTERN: u8 = 0x05;
/// Byte written over a page's contents when it is retired to a free
/// stack, so dangling references are detectable.
pub const FREE_PATTERN: u8 = 0x01;

/// Number of refcount stripes. Stripe `s` owns the counts of every page
/// congruent to `s`.
const STRIPE_COUNT: usize = 8;

struct Frame {
    data: Mutex<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    frees: AtomicU64,
    steals: AtomicU64,
    exhaustions: AtomicU64,
}

/// Monotonic operation counters, snapshotted by [`PageAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Pages retired to a free stack (refcount reached zero).
    pub frees: u64,
    /// Allocations served from a neighbor's stack.
    pub steals: u64,
    /// Allocations that failed with every stack empty.
    pub exhaustions: u64,
}

/// Sharded, reference-counted pool of fixed-size page frames.
///
/// One explicitly constructed context owns every frame, stack and lock;
/// built once at startup and shared by reference for the process
/// lifetime.
pub struct PageAllocator {
    frames: Box<[Frame]>,
    /// Per-shard LIFO free stacks of page indices.
    shards: Box<[Mutex<Vec<usize>>]>,
    /// Refcount stripes, independent of (and never nested with) the
    /// shard locks. `stripes[p % STRIPE_COUNT][p / STRIPE_COUNT]` is the
    /// count for page `p`.
    stripes: Box<[Mutex<Vec<u32>>]>,
    page_size: usize,
    counters: Counters,
}

impl PageAllocator {
    /// Pool of `page_count` default-size pages across `shard_count`
    /// shards.
    #[must_use]
    pub fn new(page_count: usize, shard_count: usize) -> Self {
        Self::with_page_size(page_count, shard_count, PAGE_SIZE)
    }

    /// Pool with an explicit page size. All pages are registered here,
    /// round-robin across the shards, filled with [`FREE_PATTERN`].
    #[must_use]
    pub fn with_page_size(page_count: usize, shard_count: usize, page_size: usize) -> Self {
        assert!(page_count > 0, "empty page pool");
        assert!(shard_count > 0, "no shards");
        assert!(page_size > 0, "zero-sized pages");

        let frames: Box<[Frame]> = (0..page_count)
            .map(|_| Frame {
                data: Mutex::new(vec![FREE_PATTERN; page_size].into_boxed_slice()),
            })
            .collect();

        let mut shards: Vec<Mutex<Vec<usize>>> =
            (0..shard_count).map(|_| Mutex::new(Vec::new())).collect();
        for page in 0..page_count {
            shards[page % shard_count].get_mut().push(page);
        }

        let mut stripes: Vec<Mutex<Vec<u32>>> =
            (0..STRIPE_COUNT).map(|_| Mutex::new(Vec::new())).collect();
        for page in 0..page_count {
            stripes[page % STRIPE_COUNT].get_mut().push(0);
        }

        Self {
            frames,
            shards: shards.into_boxed_slice(),
            stripes: stripes.into_boxed_slice(),
            page_size,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
            exhaustions: self.counters.exhaustions.load(Ordering::Relaxed),
        }
    }

    /// Number of pages currently on `shard`'s free stack.
    #[must_use]
    pub fn shard_depth(&self, shard: usize) -> usize {
        self.shards[shard].lock().len()
    }

    /// Total pages on all free stacks. Advisory — stacks are sampled one
    /// at a time.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Sum of all page refcounts: the number of outstanding owners.
    /// Advisory, like [`free_pages`](Self::free_pages).
    #[must_use]
    pub fn live_refs(&self) -> u64 {
        self.stripes
            .iter()
            .map(|stripe| stripe.lock().iter().map(|&rc| u64::from(rc)).sum::<u64>())
            .sum()
    }

    /// Current refcount of one page.
    #[must_use]
    pub fn refcount(&self, page: usize) -> u32 {
        self.with_refcount(page, |rc| *rc)
    }

    /// Pop a free page, preferring `shard`'s own stack and rotating
    /// through the neighbors on local exhaustion, one stack lock at a
    /// time. The page comes back with refcount 1 and its contents
    /// overwritten with [`ALLOC_PATTERN`].
    pub fn allocate(&self, shard: usize) -> Result<usize, Exhausted> {
        assert!(shard < self.shards.len(), "shard {shard} out of range");

        let count = self.shards.len();
        for step in 0..count {
            let source = (shard + step) % count;
            let Some(page) = self.shards[source].lock().pop() else {
                continue;
            };
            // The page is off every stack now, so nothing else can touch
            // it until the refcount says Busy.
            self.with_refcount(page, |rc| {
                assert_eq!(*rc, 0, "free-stack page {page} has refcount {rc}");
                *rc = 1;
            });
            self.frames[page].data.lock().fill(ALLOC_PATTERN);

            self.counters.allocations.fetch_add(1, Ordering::Relaxed);
            if source == shard {
                trace!(page, shard, "allocated page");
            } else {
                self.counters.steals.fetch_add(1, Ordering::Relaxed);
                debug!(page, from = source, to = shard, "stole page from shard");
            }
            return Ok(page);
        }

        self.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
        warn!(shard, "page pool exhausted");
        Err(Exhausted)
    }

    /// Adjust a busy page's refcount by `delta` under its stripe lock,
    /// as when an owner begins or stops sharing the page (copy-on-write).
    /// Returns the new count.
    ///
    /// # Panics
    ///
    /// Panics if the page is free, or if `delta` would take the count to
    /// zero or below — [`free`](Self::free) is the only path that may
    /// retire a page, otherwise it would leak off every free stack.
    pub fn add_reference(&self, page: usize, delta: i32) -> u32 {
        self.with_refcount(page, |rc| {
            assert!(*rc > 0, "add_reference on free page {page}");
            let next = i64::from(*rc) + i64::from(delta);
            if next <= 0 {
                panic!("add_reference takes page {page} to {next}");
            }
            *rc = u32::try_from(next).expect("page refcount overflow");
            *rc
        })
    }

    /// Drop one owner of `page`. Only when the last owner lets go is the
    /// page sanitized with [`FREE_PATTERN`] and pushed onto the *calling*
    /// context's shard stack — not necessarily the shard it came from.
    ///
    /// # Panics
    ///
    /// Panics on a double free (refcount already zero).
    pub fn free(&self, shard: usize, page: usize) {
        assert!(shard < self.shards.len(), "shard {shard} out of range");
        assert!(page < self.frames.len(), "page {page} out of range");

        let remaining = self.with_refcount(page, |rc| {
            *rc = match rc.checked_sub(1) {
                Some(n) => n,
                None => panic!("double free of page {page}"),
            };
            *rc
        });
        if remaining > 0 {
            trace!(page, remaining, "dropped page reference");
            return;
        }

        self.frames[page].data.lock().fill(FREE_PATTERN);
        self.shards[shard].lock().push(page);
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        trace!(page, shard, "retired page to free stack");
    }

    /// Exclusive access to a page's contents for its owner.
    pub fn page(&self, page: usize) -> PageRef<'_> {
        PageRef {
            guard: self.frames[page].data.lock(),
        }
    }

    fn with_refcount<R>(&self, page: usize, f: impl FnOnce(&mut u32) -> R) -> R {
        let stripe = page % STRIPE_COUNT;
        let mut counts = self.stripes[stripe].lock();
        f(&mut counts[page / STRIPE_COUNT])
    }
}

/// Locked view of one page frame's contents.
pub struct PageRef<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl std::ops::Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for PageRef<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize, shards: usize) -> PageAllocator {
        PageAllocator::with_page_size(pages, shards, 64)
    }

    #[test]
    fn fresh_pool_is_fully_free() {
        let alloc = pool(8, 4);
        assert_eq!(alloc.free_pages(), 8);
        assert_eq!(alloc.live_refs(), 0);
        for shard in 0..4 {
            assert_eq!(alloc.shard_depth(shard), 2);
        }
        assert!(alloc.page(3).iter().all(|&b| b == FREE_PATTERN));
    }

    #[test]
    fn allocate_sets_refcount_and_sanitizes() {
        let alloc = pool(8, 4);
        let page = alloc.allocate(0).unwrap();
        assert_eq!(alloc.refcount(page), 1);
        assert!(alloc.page(page).iter().all(|&b| b == ALLOC_PATTERN));
        assert_eq!(alloc.free_pages(), 7);
    }

    #[test]
    fn free_sanitizes_and_returns_to_callers_shard() {
        let alloc = pool(8, 4);
        let page = alloc.allocate(0).unwrap();
        {
            let mut frame = alloc.page(page);
            frame.fill(0xEE);
        }

        alloc.free(3, page);
        assert_eq!(alloc.refcount(page), 0);
        assert_eq!(alloc.shard_depth(3), 3);
        assert_eq!(alloc.shard_depth(0), 1);
        assert!(alloc.page(page).iter().all(|&b| b == FREE_PATTERN));
    }

    #[test]
    fn empty_shard_steals_from_neighbor() {
        let alloc = pool(8, 4);

        // Drain shard 0's own two pages.
        let local_a = alloc.allocate(0).unwrap();
        let local_b = alloc.allocate(0).unwrap();
        assert_eq!(alloc.stats().steals, 0);

        // Third allocation on shard 0 must borrow from shard 1.
        let stolen = alloc.allocate(0).unwrap();
        assert_eq!(alloc.stats().steals, 1);
        assert_eq!(alloc.shard_depth(1), 1);

        // Freeing from shard 0's context repatriates the page to shard 0.
        alloc.free(0, stolen);
        assert_eq!(alloc.shard_depth(0), 1);
        let again = alloc.allocate(0).unwrap();
        assert_eq!(again, stolen);
        assert_eq!(alloc.stats().steals, 1);

        alloc.free(0, local_a);
        alloc.free(0, local_b);
        alloc.free(0, again);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let alloc = pool(2, 1);
        let a = alloc.allocate(0).unwrap();
        let b = alloc.allocate(0).unwrap();
        assert_eq!(alloc.allocate(0), Err(Exhausted));
        assert_eq!(alloc.stats().exhaustions, 1);

        // Freeing makes the pool usable again.
        alloc.free(0, a);
        assert!(alloc.allocate(0).is_ok());
        let _ = b;
    }

    #[test]
    fn shared_page_retires_only_at_last_free() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        assert_eq!(alloc.add_reference(page, 1), 2);

        alloc.free(0, page);
        assert_eq!(alloc.refcount(page), 1);
        assert_eq!(alloc.free_pages(), 3); // still busy

        alloc.free(1, page);
        assert_eq!(alloc.refcount(page), 0);
        assert_eq!(alloc.free_pages(), 4);
        // Retired by the second freer, so it landed on shard 1's stack.
        assert_eq!(alloc.shard_depth(1), 3);
    }

    #[test]
    #[should_panic(expected = "double free of page")]
    fn double_free_is_fatal() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        alloc.free(0, page);
        alloc.free(0, page);
    }

    #[test]
    #[should_panic(expected = "add_reference on free page")]
    fn add_reference_on_free_page_is_fatal() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        alloc.free(0, page);
        alloc.add_reference(page, 1);
    }

    #[test]
    #[should_panic(expected = "takes page")]
    fn add_reference_may_not_retire_a_page() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        alloc.add_reference(page, -1);
    }

    #[test]
    fn negative_delta_drops_a_sharer() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        alloc.add_reference(page, 2);
        assert_eq!(alloc.add_reference(page, -1), 2);
        assert_eq!(alloc.refcount(page), 2);
    }

    #[test]
    fn owner_writes_survive_until_free() {
        let alloc = pool(4, 2);
        let page = alloc.allocate(0).unwrap();
        {
            let mut frame = alloc.page(page);
            frame[..4].copy_from_slice(b"cow!");
        }
        assert_eq!(&alloc.page(page)[..4], b"cow!");
    }
}
