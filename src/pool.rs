use alloc::collections::{BTreeMap, BTreeSet};

use crate::meta::{BatchId, BlockId};

/// Describes one free block.
///
/// Entries order by batch, then size, then offset, so that a range query
/// starting at `(batch, size, 0)` yields the best fit within `batch`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PoolEntry {
    pub batch: BatchId,
    pub size: usize,
    pub offset: usize,
}

impl PoolEntry {
    #[inline]
    pub fn new(batch: BatchId, size: usize, offset: usize) -> PoolEntry {
        PoolEntry {
            batch,
            size,
            offset,
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        BlockId::new(self.batch, self.offset)
    }
}

/// The set of free blocks.
///
/// At most one free block may start at any address.
#[derive(Default, Debug)]
pub struct Pool {
    entries: BTreeSet<PoolEntry>,
    /// Size of the entry starting at each address.
    sizes: BTreeMap<BlockId, usize>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            entries: BTreeSet::new(),
            sizes: BTreeMap::new(),
        }
    }

    /// Adds a free block.
    ///
    /// # Panics
    ///
    /// Panics if a block starting at the same address is already present,
    /// whatever its size.
    pub fn insert(&mut self, entry: PoolEntry) {
        if let Some(size) = self.sizes.get(&entry.id()) {
            log::error!("pool already holds {size:#x} bytes at {entry:?}");
            panic!("block already in pool: {entry:?}");
        }

        self.sizes.insert(entry.id(), entry.size);
        self.entries.insert(entry);
    }

    /// Removes a free block.
    ///
    /// # Panics
    ///
    /// Panics if the entry is absent, which means the pool and the metadata
    /// store have diverged.
    pub fn erase(&mut self, entry: &PoolEntry) {
        assert!(
            self.entries.remove(entry),
            "block missing from pool: {entry:?}"
        );
        self.sizes.remove(&entry.id());
    }

    /// Finds the smallest free block of at least `size` bytes, searching the
    /// newest batch first.
    pub fn find_exist_chunk(&self, size: usize) -> Option<PoolEntry> {
        let mut batch = self.entries.last()?.batch;

        loop {
            let lo = PoolEntry::new(batch, size, 0);
            let hi = PoolEntry::new(batch, usize::MAX, usize::MAX);

            if let Some(found) = self.entries.range(lo..=hi).next() {
                return Some(*found);
            }

            // Step to the next older batch that has any free block at all.
            let floor = PoolEntry::new(batch, 0, 0);
            batch = self.entries.range(..floor).next_back()?.batch;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, entry: &PoolEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> + '_ {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(batch: u64, size: usize, offset: usize) -> PoolEntry {
        PoolEntry::new(BatchId(batch), size, offset)
    }

    #[test]
    fn empty_pool_finds_nothing() {
        assert_eq!(Pool::new().find_exist_chunk(1), None);
    }

    #[test]
    fn best_fit_within_batch() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 1024, 0));
        pool.insert(entry(0, 256, 2048));
        pool.insert(entry(0, 256, 1024));
        pool.insert(entry(0, 64, 4096));

        assert_eq!(pool.find_exist_chunk(100), Some(entry(0, 256, 1024)));
        assert_eq!(pool.find_exist_chunk(64), Some(entry(0, 64, 4096)));
        assert_eq!(pool.find_exist_chunk(2048), None);
    }

    #[test]
    fn newest_batch_is_searched_first() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.insert(entry(1, 4096, 0));
        pool.insert(entry(2, 32, 0));

        // Batch 2 has nothing large enough; batch 1 wins over the tighter fit
        // in batch 0.
        assert_eq!(pool.find_exist_chunk(64), Some(entry(1, 4096, 0)));
        assert_eq!(pool.find_exist_chunk(16), Some(entry(2, 32, 0)));
    }

    #[test]
    fn falls_back_to_older_batches() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 4096, 0));
        pool.insert(entry(5, 64, 0));
        pool.insert(entry(7, 128, 0));

        assert_eq!(pool.find_exist_chunk(256), Some(entry(0, 4096, 0)));
    }

    #[test]
    fn erase_and_accounting() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.insert(entry(0, 128, 128));
        assert_eq!(pool.free_bytes(), 192);

        pool.erase(&entry(0, 64, 0));
        assert_eq!(pool.len(), 1);
        assert!(!pool.contains(&entry(0, 64, 0)));
    }

    #[test]
    #[should_panic(expected = "block missing from pool")]
    fn erase_missing_panics() {
        Pool::new().erase(&entry(0, 64, 0));
    }

    #[test]
    #[should_panic(expected = "block already in pool")]
    fn duplicate_insert_panics() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.insert(entry(0, 64, 0));
    }

    #[test]
    #[should_panic(expected = "block already in pool")]
    fn second_block_at_same_address_panics() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.insert(entry(0, 128, 0));
    }

    #[test]
    fn same_offset_in_other_batch_is_distinct() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.insert(entry(1, 128, 0));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn address_is_reusable_after_erase() {
        let mut pool = Pool::new();
        pool.insert(entry(0, 64, 0));
        pool.erase(&entry(0, 64, 0));
        pool.insert(entry(0, 128, 0));

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.find_exist_chunk(65), Some(entry(0, 128, 0)));
    }
}
