//! A batched binary-buddy allocator.

use alloc::collections::BTreeMap;
use core::{fmt, mem, ptr::NonNull};

use sptr::Strict;

use crate::{
    backend::BackingAllocator,
    base::BasePtr,
    config::ChunkConfig,
    meta::{BatchId, BlockId, BlockState, Metadata, MetadataStore},
    pool::{Pool, PoolEntry},
    AllocError,
};

/// One region acquired from the backing allocator.
#[derive(Debug)]
struct Batch {
    base: BasePtr,
    /// Whether the batch is subdivided through the pool. Oversize allocations
    /// occupy a batch of their own that is never pooled.
    pooled: bool,
}

/// A snapshot of an allocator's accounting.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct BuddyStats {
    /// Bytes in blocks currently handed out, including oversize allocations.
    pub used: usize,
    /// Bytes in free blocks held in the pool.
    pub free: usize,
    /// Bytes currently held from the backing allocator.
    pub acquired: usize,
    /// Number of regions currently held from the backing allocator.
    pub batches: usize,
    /// Number of free blocks in the pool.
    pub free_blocks: usize,
    /// Number of live oversize allocations.
    pub unpooled: usize,
}

/// A binary-buddy allocator over batches acquired from a [`BackingAllocator`].
///
/// Requests are rounded up to a multiple of the configuration's minimum chunk
/// size and served from the smallest power-of-two block that fits. When no
/// free block is large enough, a new batch of `max_chunk_size` bytes is
/// acquired from the backing allocator. Requests larger than
/// `max_chunk_size` bypass the pool: they are acquired and released one to
/// one.
///
/// Freed blocks are merged with their buddy, repeatedly, for as long as the
/// buddy is free. Blocks are only ever merged within the batch they were
/// carved from.
///
/// `BuddyAllocator` is not synchronized; see [`LockedBuddyAllocator`] for a
/// version that can be shared between threads.
pub struct BuddyAllocator<B: BackingAllocator> {
    config: ChunkConfig,
    batches: BTreeMap<BatchId, Batch>,
    /// Maps the base address of each batch to its identifier.
    bases: BTreeMap<usize, BatchId>,
    next_batch: u64,
    pool: Pool,
    meta: MetadataStore,
    total_used: usize,
    total_free: usize,
    total_acquired: usize,
    backend: B,
}

// SAFETY: The allocator exclusively owns every batch it holds and never
// dereferences pointers into them, so moving it to another thread is sound if
// the backing allocator can be moved as well.
unsafe impl<B: BackingAllocator + Send> Send for BuddyAllocator<B> {}

impl<B: BackingAllocator> BuddyAllocator<B> {
    /// Constructs a new `BuddyAllocator` which acquires memory from `backend`.
    ///
    /// No memory is acquired until the first allocation.
    pub fn new(backend: B, config: ChunkConfig) -> BuddyAllocator<B> {
        BuddyAllocator {
            config,
            batches: BTreeMap::new(),
            bases: BTreeMap::new(),
            next_batch: 0,
            pool: Pool::new(),
            meta: MetadataStore::new(),
            total_used: 0,
            total_free: 0,
            total_acquired: 0,
            backend,
        }
    }

    /// Returns the allocator's chunk configuration.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Returns a reference to the backing allocator.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the number of bytes in blocks currently handed out.
    #[inline]
    pub fn used(&self) -> usize {
        self.total_used
    }

    /// Returns the number of bytes in free blocks held in the pool.
    #[inline]
    pub fn free(&self) -> usize {
        self.total_free
    }

    /// Returns a snapshot of the allocator's accounting.
    pub fn stats(&self) -> BuddyStats {
        BuddyStats {
            used: self.total_used,
            free: self.total_free,
            acquired: self.total_acquired,
            batches: self.batches.len(),
            free_blocks: self.pool.len(),
            unpooled: self.batches.values().filter(|b| !b.pooled).count(),
        }
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a pointer to the whole block; its length is the
    /// usable size, which may exceed `size`. Oversize requests are served with
    /// exactly `size` bytes.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// - `Err(AllocError::ZeroSize)` if `size` is zero.
    /// - `Err(AllocError::OutOfMemory)` if the backing allocator cannot
    ///   provide the memory needed.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        if self.config.is_oversize(size) {
            return self.allocate_unpooled(size);
        }

        let rounded = self
            .config
            .round_up(size)
            .ok_or(AllocError::OutOfMemory { size })?;

        let entry = match self.pool.find_exist_chunk(rounded) {
            Some(entry) => entry,
            None => self.refill_pool(rounded)?,
        };

        let block = self.split_to_alloc(entry, rounded);
        log::trace!(
            "allocated {:#x} bytes for a {:#x}-byte request",
            block.len(),
            size
        );

        Ok(block)
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// # Panics
    ///
    /// This method panics if `ptr` does not denote the start of a block
    /// currently allocated by this allocator, which includes freeing a block
    /// twice. It also panics if the allocator's bookkeeping is found to be
    /// corrupted. Neither condition is recoverable.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let id = self.block_id_of(ptr);
        let meta = self.meta.load(id);

        match meta.state {
            BlockState::Used => (),
            BlockState::Unpooled => return self.release_unpooled(meta),
            BlockState::Free => {
                log::error!("double free of block at {:p}", ptr);
                panic!(
                    "double free of block at offset {:#x} of {}",
                    id.offset, id.batch
                );
            }
        }

        self.total_used -= meta.size;
        self.total_free += meta.size;

        let mut block = PoolEntry::new(id.batch, meta.size, id.offset);
        self.record(id, meta.size, BlockState::Free);
        self.pool.insert(block);

        let batch_size = self.batch(id.batch).base.extent();

        while block.size < batch_size {
            let buddy = PoolEntry::new(block.batch, block.size, block.offset ^ block.size);

            match self.meta.get(buddy.id()) {
                Some(m) if m.is_free() && m.size == buddy.size => (),
                _ => break,
            }

            self.pool.erase(&block);
            self.pool.erase(&buddy);
            self.meta.erase(block.id());
            self.meta.erase(buddy.id());

            block = PoolEntry::new(block.batch, block.size * 2, block.offset.min(buddy.offset));

            self.record(block.id(), block.size, BlockState::Free);
            self.pool.insert(block);
        }

        log::trace!(
            "freed {:#x} bytes; coalesced into {:#x} bytes at offset {:#x} of {}",
            meta.size,
            block.size,
            block.offset,
            block.batch
        );
    }

    /// Checks that the pool, the metadata store and the counters agree.
    ///
    /// # Panics
    ///
    /// Panics on the first inconsistency found.
    pub fn validate(&self) {
        let mut used = 0;
        let mut free = 0;
        let mut free_records = 0;
        let mut covered: BTreeMap<BatchId, usize> = BTreeMap::new();

        for meta in self.meta.iter() {
            let batch = self.batch(meta.id.batch);
            let end = meta.id.offset.checked_add(meta.size);
            assert!(
                end.map_or(false, |end| end <= batch.base.extent()),
                "block overruns its batch: {meta:?}"
            );

            match meta.state {
                BlockState::Free => {
                    let entry = PoolEntry::new(meta.id.batch, meta.size, meta.id.offset);
                    assert!(
                        self.pool.contains(&entry),
                        "free block missing from pool: {meta:?}"
                    );
                    free += meta.size;
                    free_records += 1;
                }
                BlockState::Used => used += meta.size,
                BlockState::Unpooled => {
                    assert!(
                        !batch.pooled,
                        "unpooled block inside a pooled batch: {meta:?}"
                    );
                    used += meta.size;
                }
            }

            if batch.pooled {
                assert!(
                    meta.size.is_power_of_two() && meta.id.offset % meta.size == 0,
                    "misaligned buddy block: {meta:?}"
                );
            }

            *covered.entry(meta.id.batch).or_default() += meta.size;
        }

        assert_eq!(
            self.pool.len(),
            free_records,
            "pool holds blocks with no free metadata"
        );

        for entry in self.pool.iter() {
            if entry.size < self.batch(entry.batch).base.extent() {
                let buddy = BlockId::new(entry.batch, entry.offset ^ entry.size);
                let unmerged = self
                    .meta
                    .get(buddy)
                    .map_or(false, |m| m.is_free() && m.size == entry.size);
                assert!(!unmerged, "free buddies left unmerged: {entry:?}");
            }
        }

        for (id, batch) in self.batches.iter() {
            assert_eq!(
                covered.get(id).copied().unwrap_or(0),
                batch.base.extent(),
                "blocks of {id} do not tile it"
            );
        }

        assert_eq!(used, self.total_used, "used counter diverged");
        assert_eq!(
            self.pool.free_bytes(),
            self.total_free,
            "pool size diverged"
        );
        assert_eq!(free, self.total_free, "free counter diverged");
        assert_eq!(
            self.total_used + self.total_free,
            self.total_acquired,
            "used and free bytes do not add up to acquired bytes"
        );
    }

    /// Invalidates the guard of the block at `ptr`.
    #[cfg(test)]
    pub(crate) fn corrupt_metadata(&mut self, ptr: NonNull<u8>) {
        let id = self.block_id_of(ptr);
        self.meta.corrupt(id);
    }

    /// Creates or overwrites the metadata record of a block.
    fn record(&mut self, id: BlockId, size: usize, state: BlockState) {
        self.meta.store(Metadata::new(id, size, state));
    }

    fn batch(&self, id: BatchId) -> &Batch {
        match self.batches.get(&id) {
            Some(batch) => batch,
            None => panic!("metadata refers to unknown {id}"),
        }
    }

    /// Resolves a pointer handed out by this allocator to its block.
    fn block_id_of(&self, ptr: NonNull<u8>) -> BlockId {
        let addr = ptr.as_ptr().addr();

        let found = self
            .bases
            .range(..=addr)
            .next_back()
            .map(|(_, &id)| (id, self.batch(id).base))
            .filter(|(_, base)| base.contains_addr(addr));

        match found {
            Some((id, base)) => BlockId::new(id, base.offset_to(addr)),
            None => {
                log::error!("free of foreign pointer {:p}", ptr);
                panic!(
                    "invalid free: {addr:#x} was not allocated by this allocator"
                );
            }
        }
    }

    fn register_batch(&mut self, ptr: NonNull<u8>, size: usize, pooled: bool) -> BatchId {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;

        let base = BasePtr::new(ptr, size);
        self.bases.insert(base.addr().get(), id);
        self.batches.insert(id, Batch { base, pooled });
        self.total_acquired += size;

        log::debug!(
            "acquired {} of {:#x} bytes from {:?} backend",
            id,
            size,
            self.backend.placement()
        );

        id
    }

    /// Acquires a new batch and registers it as a single free block.
    ///
    /// `size` is the rounded size of the request that missed the pool.
    fn refill_pool(&mut self, size: usize) -> Result<PoolEntry, AllocError> {
        let full = self.config.max_chunk_size();

        let (ptr, batch_size) = match self.backend.acquire(full) {
            Ok(ptr) => (ptr, full),
            Err(e) => {
                let retry = match self.config.retry_size_for(size) {
                    Some(retry) => retry,
                    None => {
                        log::warn!("refill of {:#x} bytes failed: {}", full, e);
                        return Err(AllocError::OutOfMemory { size: full });
                    }
                };

                log::warn!(
                    "refill of {:#x} bytes failed ({}); retrying with {:#x} bytes",
                    full,
                    e,
                    retry
                );

                match self.backend.acquire(retry) {
                    Ok(ptr) => (ptr, retry),
                    Err(e) => {
                        log::warn!("refill of {:#x} bytes failed: {}", retry, e);
                        return Err(AllocError::OutOfMemory { size: retry });
                    }
                }
            }
        };

        let batch = self.register_batch(ptr, batch_size, true);
        let entry = PoolEntry::new(batch, batch_size, 0);

        self.record(entry.id(), batch_size, BlockState::Free);
        self.pool.insert(entry);
        self.total_free += batch_size;

        // The new batch is the newest and holds a single block of at least
        // `size` bytes, so it is exactly what `find_exist_chunk` would return.
        Ok(entry)
    }

    /// Splits the free block `entry` down to the smallest block that holds
    /// `size` bytes and marks that block used.
    fn split_to_alloc(&mut self, entry: PoolEntry, size: usize) -> NonNull<[u8]> {
        self.pool.erase(&entry);

        let mut block = entry;
        while block.size / 2 >= size {
            let half = block.size / 2;

            // The front half keeps the parent's offset, so its record replaces
            // the parent's once the split is done.
            let back = PoolEntry::new(block.batch, half, block.offset + half);
            self.record(back.id(), half, BlockState::Free);
            self.pool.insert(back);

            block.size = half;
        }

        self.record(block.id(), block.size, BlockState::Used);
        self.total_free -= block.size;
        self.total_used += block.size;

        self.batch(block.batch)
            .base
            .with_offset_and_len(block.offset, block.size)
    }

    fn allocate_unpooled(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.backend.acquire(size).map_err(|e| {
            log::warn!("oversize allocation of {:#x} bytes failed: {}", size, e);
            AllocError::OutOfMemory { size }
        })?;

        let batch = self.register_batch(ptr, size, false);
        self.record(BlockId::new(batch, 0), size, BlockState::Unpooled);
        self.total_used += size;

        Ok(self.batch(batch).base.with_offset_and_len(0, size))
    }

    fn release_unpooled(&mut self, meta: Metadata) {
        let batch = match self.batches.remove(&meta.id.batch) {
            Some(batch) => batch,
            None => panic!("metadata refers to unknown {}", meta.id.batch),
        };

        self.bases.remove(&batch.base.addr().get());
        self.meta.erase(meta.id);
        self.total_used -= meta.size;
        self.total_acquired -= meta.size;

        log::debug!(
            "releasing oversize {} of {:#x} bytes",
            meta.id.batch,
            meta.size
        );

        // SAFETY: the batch was acquired with exactly `meta.size` bytes and has
        // just been unregistered, so it cannot be released again.
        unsafe { self.backend.release(batch.base.ptr(), meta.size) };
    }
}

impl<B: BackingAllocator> Drop for BuddyAllocator<B> {
    fn drop(&mut self) {
        if self.total_used != 0 {
            log::debug!(
                "dropping allocator with {:#x} bytes still allocated",
                self.total_used
            );
        }

        for (_, batch) in mem::take(&mut self.batches) {
            // SAFETY: every registered batch was acquired from `backend` with
            // exactly its extent and is released only here or on free.
            unsafe { self.backend.release(batch.base.ptr(), batch.base.extent()) };
        }
    }
}

impl<B: BackingAllocator> fmt::Debug for BuddyAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("config", &self.config)
            .field("placement", &self.backend.placement())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A [`BuddyAllocator`] guarded by a single lock.
///
/// Allocation, deallocation and accounting queries fully serialize against
/// each other. Refilling the pool calls into the backing allocator with the
/// lock held.
///
/// The lock is a [`spin::Mutex`]: it needs no operating system support and is
/// not poisoned when a fatal check panics while it is held. Waiting threads
/// busy-wait, in no particular order, for as long as the holder runs. A refill
/// that blocks inside a slow device acquisition therefore keeps every other
/// caller spinning until it returns. Callers that expect heavy contention on
/// one allocator should serialize access at a higher level, for example by
/// giving each thread or stream its own allocator.
pub struct LockedBuddyAllocator<B: BackingAllocator> {
    inner: spin::Mutex<BuddyAllocator<B>>,
}

impl<B: BackingAllocator> LockedBuddyAllocator<B> {
    /// Constructs a new `LockedBuddyAllocator` which acquires memory from
    /// `backend`.
    pub fn new(backend: B, config: ChunkConfig) -> LockedBuddyAllocator<B> {
        BuddyAllocator::new(backend, config).into()
    }

    /// Locks the allocator, giving direct access to the inner allocator.
    pub fn lock(&self) -> spin::MutexGuard<'_, BuddyAllocator<B>> {
        self.inner.lock()
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// See [`BuddyAllocator::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.inner.lock().allocate(size)
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// See [`BuddyAllocator::deallocate`].
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.inner.lock().deallocate(ptr)
    }

    /// Returns the number of bytes in blocks currently handed out.
    pub fn used(&self) -> usize {
        self.inner.lock().used()
    }

    /// Returns a snapshot of the allocator's accounting.
    pub fn stats(&self) -> BuddyStats {
        self.inner.lock().stats()
    }

    /// Consumes the lock, returning the inner allocator.
    pub fn into_inner(self) -> BuddyAllocator<B> {
        self.inner.into_inner()
    }
}

impl<B: BackingAllocator> From<BuddyAllocator<B>> for LockedBuddyAllocator<B> {
    fn from(allocator: BuddyAllocator<B>) -> Self {
        LockedBuddyAllocator {
            inner: spin::Mutex::new(allocator),
        }
    }
}

impl<B: BackingAllocator> fmt::Debug for LockedBuddyAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("LockedBuddyAllocator")
                .field("inner", &*inner)
                .finish(),
            None => f
                .debug_struct("LockedBuddyAllocator")
                .finish_non_exhaustive(),
        }
    }
}
