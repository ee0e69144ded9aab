//! Buffer cache.
//!
//! An identity-keyed cache of block contents over a fixed pool of slots,
//! partitioned into shards by block number. Each shard owns a membership
//! list of slot indices under a short mutex; a slot's contents sit behind
//! a separate exclusive lock that parks waiters and may be held across a
//! storage transfer.
//!
//! Interface:
//! * [`BufferCache::acquire`] returns the unique slot for a key with its
//!   refcount raised and its content lock held.
//! * [`BufHandle::load`] / [`BufHandle::commit`] move contents between the
//!   slot and the storage device.
//! * Dropping (or [`BufHandle::release`]-ing) the handle unlocks the
//!   contents and drops the refcount; do not retain the key's data after.
//! * [`BufferCache::pin`] / [`BufferCache::unpin`] keep a slot resident
//!   across operation boundaries without holding its content lock.
//!
//! Locking discipline: the fast path takes only the home shard's lock.
//! Misses take the global ordering lock first, then at most one shard
//! lock at a time, so two contexts can never select the same remote
//! victim or deadlock on a pair of shards.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::storage::{BlockDevice, BlockId};

/// Default number of cache slots.
pub const POOL_SIZE: usize = 30;
/// Default number of shards; prime, to spread block numbers well.
pub const SHARD_COUNT: usize = 13;
/// Default block size in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Bookkeeping guarded by the owning shard's lock (and, for decrements,
/// by the slot's own short meta lock).
struct SlotMeta {
    /// Identity currently assigned to this slot; `None` until first use.
    key: Option<BlockId>,
    /// Number of outstanding handles and pins. Nonzero excludes the slot
    /// from victim selection.
    refcount: u32,
    /// Recency stamp taken from the cache clock when the refcount last
    /// dropped to zero. Lower means a better eviction candidate.
    last_use: u64,
    /// Index of the shard whose membership list currently holds the slot.
    shard: usize,
}

/// Contents guarded by the slot's exclusive (parking) lock.
struct SlotContent {
    /// False until the first successful load after a key assignment.
    valid: bool,
    data: Box<[u8]>,
}

struct Slot {
    meta: Mutex<SlotMeta>,
    content: Mutex<SlotContent>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    steals: AtomicU64,
}

/// Monotonic operation counters, snapshotted by [`BufferCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Acquires satisfied by an existing slot for the key.
    pub hits: u64,
    /// Acquires that had to repurpose a slot.
    pub misses: u64,
    /// Slots repurposed within the key's home shard.
    pub evictions: u64,
    /// Slots migrated from another shard's membership.
    pub steals: u64,
}

/// Sharded buffer cache over a block device.
///
/// Constructed once at startup and shared by reference for the process
/// lifetime; it is never torn down while handles are live.
pub struct BufferCache<D> {
    device: D,
    slots: Box<[Slot]>,
    /// Per-shard membership: indices into `slots`.
    shards: Box<[Mutex<Vec<usize>>]>,
    /// Total order for any operation touching more than one shard's
    /// membership. Always taken before any shard lock.
    global: Mutex<()>,
    /// Recency clock; starts at 1 so a stamped slot never ties with a
    /// never-used one.
    clock: AtomicU64,
    block_size: usize,
    counters: Counters,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Cache with the default geometry.
    pub fn new(device: D) -> Self {
        Self::with_geometry(device, POOL_SIZE, SHARD_COUNT, BLOCK_SIZE)
    }

    /// Cache with explicit geometry. All slots are allocated here and
    /// never destroyed; they start keyless, unreferenced, and spread
    /// round-robin across the shards.
    pub fn with_geometry(
        device: D,
        pool_size: usize,
        shard_count: usize,
        block_size: usize,
    ) -> Self {
        assert!(pool_size > 0, "empty slot pool");
        assert!(shard_count > 0, "no shards");
        assert!(block_size > 0, "zero-sized blocks");

        let slots: Box<[Slot]> = (0..pool_size)
            .map(|i| Slot {
                meta: Mutex::new(SlotMeta {
                    key: None,
                    refcount: 0,
                    last_use: 0,
                    shard: i % shard_count,
                }),
                content: Mutex::new(SlotContent {
                    valid: false,
                    data: vec![0u8; block_size].into_boxed_slice(),
                }),
            })
            .collect();

        let mut shards: Vec<Mutex<Vec<usize>>> =
            (0..shard_count).map(|_| Mutex::new(Vec::new())).collect();
        for i in 0..pool_size {
            shards[i % shard_count].get_mut().push(i);
        }

        Self {
            device,
            slots,
            shards: shards.into_boxed_slice(),
            global: Mutex::new(()),
            clock: AtomicU64::new(1),
            block_size,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
        }
    }

    /// Sum of all slot refcounts: the number of outstanding handles and
    /// pins. Advisory — the total can shift while shards are scanned.
    #[must_use]
    pub fn live_refs(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| u64::from(slot.meta.lock().refcount))
            .sum()
    }

    fn shard_for(&self, id: BlockId) -> usize {
        id.block as usize % self.shards.len()
    }

    /// Return the unique slot for `id` with refcount raised and the
    /// exclusive content lock held. Parks if another context holds the
    /// lock.
    ///
    /// # Panics
    ///
    /// Panics if every slot in the pool is referenced: exhaustion with
    /// everything pinned is a sizing error, not a transient condition.
    pub fn acquire(&self, id: BlockId) -> BufHandle<'_, D> {
        let home = self.shard_for(id);

        // Fast path: shard-local hit under the shard lock alone.
        if let Some(idx) = self.lookup_and_ref(home, id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(block = %id, slot = idx, "buffer cache hit");
            return self.lock_handle(idx, id);
        }

        // Miss: the global lock imposes a total order on all cross-shard
        // work, so no two contexts can pick the same remote victim.
        let ordering = self.global.lock();

        // Another context may have inserted the key between the fast-path
        // probe and taking the global lock.
        if let Some(idx) = self.lookup_and_ref(home, id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(block = %id, slot = idx, "buffer cache hit after recheck");
            drop(ordering);
            return self.lock_handle(idx, id);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // Lowest-recency unreferenced member of the home shard.
        {
            let mut members = self.shards[home].lock();
            if let Some(pos) = self.victim_position(&members) {
                let idx = members[pos];
                self.repurpose(idx, id, home);
                drop(members);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(block = %id, slot = idx, shard = home, "evicted local slot");
                drop(ordering);
                return self.lock_handle(idx, id);
            }
        }

        // Probe the remaining shards in a fixed rotation, holding the
        // global lock plus exactly one probed shard's lock at a time.
        for step in 1..self.shards.len() {
            let origin = (home + step) % self.shards.len();
            let idx = {
                let mut members = self.shards[origin].lock();
                let Some(pos) = self.victim_position(&members) else {
                    continue;
                };
                let idx = members.swap_remove(pos);
                self.repurpose(idx, id, home);
                idx
            };
            self.shards[home].lock().push(idx);
            self.counters.steals.fetch_add(1, Ordering::Relaxed);
            debug!(block = %id, slot = idx, from = origin, to = home, "stole slot from shard");
            drop(ordering);
            return self.lock_handle(idx, id);
        }

        panic!("buffer cache exhausted: no unreferenced slot for block {id}");
    }

    /// Acquire and load in one step.
    pub fn read(&self, id: BlockId) -> Result<BufHandle<'_, D>, StorageError> {
        let mut handle = self.acquire(id);
        handle.load()?;
        Ok(handle)
    }

    /// Raise the refcount of a resident key without touching its content
    /// lock, excluding the slot from eviction.
    ///
    /// # Panics
    ///
    /// Panics if the key is not resident; pinning a block the cache does
    /// not hold is a programming error.
    pub fn pin(&self, id: BlockId) {
        let home = self.shard_for(id);
        if self.lookup_and_ref(home, id).is_none() {
            panic!("pin of uncached block {id}");
        }
    }

    /// Drop a refcount previously raised by [`pin`](Self::pin) (or still
    /// held on behalf of a handle).
    ///
    /// # Panics
    ///
    /// Panics if the key is not resident or its refcount is already zero.
    pub fn unpin(&self, id: BlockId) {
        let home = self.shard_for(id);
        let members = self.shards[home].lock();
        for &idx in members.iter() {
            let mut meta = self.slots[idx].meta.lock();
            if meta.key == Some(id) {
                meta.refcount = match meta.refcount.checked_sub(1) {
                    Some(n) => n,
                    None => panic!("unpin of unreferenced block {id}"),
                };
                return;
            }
        }
        panic!("unpin of uncached block {id}");
    }

    /// Scan one shard's membership for `id`; on a hit, raise the refcount.
    /// Caller must not hold any shard lock.
    fn lookup_and_ref(&self, shard: usize, id: BlockId) -> Option<usize> {
        let members = self.shards[shard].lock();
        for &idx in members.iter() {
            let mut meta = self.slots[idx].meta.lock();
            if meta.key == Some(id) {
                debug_assert_eq!(meta.shard, shard, "membership and shard tag disagree");
                meta.refcount += 1;
                return Some(idx);
            }
        }
        None
    }

    /// Position of the lowest-recency unreferenced member, if any.
    /// Caller holds the shard's lock, so no refcount can rise underneath.
    fn victim_position(&self, members: &[usize]) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (pos, &idx) in members.iter().enumerate() {
            let meta = self.slots[idx].meta.lock();
            if meta.refcount == 0 && best.is_none_or(|(_, lu)| meta.last_use < lu) {
                best = Some((pos, meta.last_use));
            }
        }
        best.map(|(pos, _)| pos)
    }

    /// Reassign a victim slot to a new key. Caller holds the global lock
    /// and the lock of the shard whose membership lists the slot.
    fn repurpose(&self, idx: usize, id: BlockId, home: usize) {
        let slot = &self.slots[idx];
        {
            let mut meta = slot.meta.lock();
            debug_assert_eq!(meta.refcount, 0, "repurposing a referenced slot");
            meta.key = Some(id);
            meta.refcount = 1;
            meta.shard = home;
        }
        // Refcount was zero and increments need the shard lock we hold,
        // so no context can be holding or awaiting the content lock.
        let mut content = slot
            .content
            .try_lock()
            .expect("content lock held on an unreferenced slot");
        content.valid = false;
    }

    fn lock_handle(&self, idx: usize, id: BlockId) -> BufHandle<'_, D> {
        // The only suspension point: parks while another holder works on
        // this slot's contents. No short lock is held here.
        let guard = self.slots[idx].content.lock();
        BufHandle {
            cache: self,
            idx,
            id,
            guard: Some(guard),
        }
    }
}

/// An acquired buffer: exclusive access to one slot's contents plus one
/// unit of its refcount. Dropping the handle releases both.
pub struct BufHandle<'a, D> {
    cache: &'a BufferCache<D>,
    idx: usize,
    id: BlockId,
    guard: Option<MutexGuard<'a, SlotContent>>,
}

impl<D> BufHandle<'_, D> {
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Index of the slot backing this handle. Two concurrent handles for
    /// the same key always report the same index (identity coherence).
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.idx
    }

    /// True once the slot holds the block's contents.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.content().valid
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.content().data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.content_mut().data
    }

    /// Release the content lock and the handle's refcount. Equivalent to
    /// dropping the handle.
    pub fn release(self) {}

    fn content(&self) -> &SlotContent {
        self.guard.as_deref().expect("handle already released")
    }

    fn content_mut(&mut self) -> &mut SlotContent {
        self.guard.as_deref_mut().expect("handle already released")
    }
}

impl<D: BlockDevice> BufHandle<'_, D> {
    /// Fill the slot from storage if it does not yet hold the block's
    /// contents. No-op when already valid; a failed read leaves the slot
    /// invalid so a later load retries.
    pub fn load(&mut self) -> Result<(), StorageError> {
        let id = self.id;
        let cache = self.cache;
        let content = self.content_mut();
        if !content.valid {
            cache.device.read_block(id, &mut content.data)?;
            content.valid = true;
        }
        Ok(())
    }

    /// Write the slot's contents through to storage. The exclusive lock
    /// is held by construction — a handle owns the content guard — so the
    /// commit-without-lock misuse cannot be expressed.
    pub fn commit(&self) -> Result<(), StorageError> {
        self.cache.device.write_block(self.id, &self.content().data)
    }
}

impl<D> Drop for BufHandle<'_, D> {
    fn drop(&mut self) {
        // Unlock the contents before the refcount can reach zero, so an
        // evictor that observes refcount 0 finds the content lock free.
        drop(self.guard.take());

        let mut meta = self.cache.slots[self.idx].meta.lock();
        meta.refcount = match meta.refcount.checked_sub(1) {
            Some(n) => n,
            None => panic!("release of unreferenced block {}", self.id),
        };
        if meta.refcount == 0 {
            meta.last_use = self.cache.clock.fetch_add(1, Ordering::Relaxed);
        }
    }
}
