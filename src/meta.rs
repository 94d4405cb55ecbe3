//! Per-block bookkeeping.
//!
//! The metadata store is the single source of truth about blocks: the pool
//! and the engine hold only [`BlockId`]s and never cache block state.

use alloc::collections::BTreeMap;
use core::fmt;

/// Identifies one acquisition from a backing allocator.
///
/// Batch identifiers increase monotonically, so a newer batch always compares
/// greater than an older one. Blocks may only be merged within a batch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BatchId(pub(crate) u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

/// Names a block by its batch and its byte offset inside that batch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId {
    pub batch: BatchId,
    pub offset: usize,
}

impl BlockId {
    #[inline]
    pub fn new(batch: BatchId, offset: usize) -> BlockId {
        BlockId { batch, offset }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockState {
    /// Available for allocation; present in the pool.
    Free,
    /// Handed out from a pooled batch.
    Used,
    /// Handed out directly from the backing allocator, outside the pool.
    Unpooled,
}

/// The bookkeeping record for one block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Metadata {
    pub id: BlockId,
    pub size: usize,
    pub state: BlockState,
    guard: u64,
}

const GUARD_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

fn guard_of(id: BlockId, size: usize, state: BlockState) -> u64 {
    let words = [id.batch.0, id.offset as u64, size as u64, state as u64];

    words.iter().fold(GUARD_SEED, |acc, &word| {
        let mixed = (acc ^ word).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed ^ (mixed >> 31)
    })
}

impl Metadata {
    pub fn new(id: BlockId, size: usize, state: BlockState) -> Metadata {
        Metadata {
            id,
            size,
            state,
            guard: guard_of(id, size, state),
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == BlockState::Free
    }

    #[inline]
    fn check_guard(&self) -> bool {
        self.guard == guard_of(self.id, self.size, self.state)
    }
}

/// Maps each live block to its metadata record.
#[derive(Default, Debug)]
pub struct MetadataStore {
    records: BTreeMap<BlockId, Metadata>,
}

impl MetadataStore {
    pub fn new() -> MetadataStore {
        MetadataStore {
            records: BTreeMap::new(),
        }
    }

    /// Loads the record for `id`.
    ///
    /// # Panics
    ///
    /// Panics if no record exists for `id` or if the record's guard does not
    /// verify. Either indicates an invalid free or corrupted bookkeeping.
    pub fn load(&self, id: BlockId) -> Metadata {
        match self.get(id) {
            Some(meta) => meta,
            None => {
                log::error!("no metadata for block at {:#x} in {}", id.offset, id.batch);
                panic!(
                    "invalid free: no block at offset {:#x} of {}",
                    id.offset, id.batch
                );
            }
        }
    }

    /// Returns the record for `id`, if one exists.
    ///
    /// # Panics
    ///
    /// Panics if the record exists but its guard does not verify.
    pub fn get(&self, id: BlockId) -> Option<Metadata> {
        let meta = *self.records.get(&id)?;

        if !meta.check_guard() {
            log::error!("metadata guard mismatch: {:?}", meta);
            panic!(
                "corrupted metadata for block at offset {:#x} of {}",
                id.offset, id.batch
            );
        }

        Some(meta)
    }

    /// Creates or overwrites the record for `meta.id`.
    pub fn store(&mut self, meta: Metadata) {
        debug_assert!(meta.check_guard());

        self.records.insert(meta.id, meta);
    }

    /// Removes the record for `id`.
    ///
    /// # Panics
    ///
    /// Panics if no record exists for `id`.
    pub fn erase(&mut self, id: BlockId) {
        assert!(
            self.records.remove(&id).is_some(),
            "erasing unknown block at offset {:#x} of {}",
            id.offset,
            id.batch
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metadata> + '_ {
        self.records.values()
    }

    /// Overwrites the guard of `id` so that it no longer verifies.
    #[cfg(test)]
    pub fn corrupt(&mut self, id: BlockId) {
        if let Some(meta) = self.records.get_mut(&id) {
            meta.guard = !meta.guard;
        }
    }
}
