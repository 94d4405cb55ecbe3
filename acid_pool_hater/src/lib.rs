#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use acid_pool::{
    AllocError, BackingAllocator, BuddyAllocator, ChunkConfig, DeviceAllocator, HostAllocator,
    LockedBuddyAllocator,
};
use alloc_hater::Subject;

/// A `BuddyAllocator` under evaluation.
///
/// Every operation is followed by a full consistency audit of the allocator.
pub struct BuddySubject<B: BackingAllocator>(BuddyAllocator<B>);

impl BuddySubject<HostAllocator> {
    pub fn host(config: ChunkConfig) -> Self {
        BuddySubject(BuddyAllocator::new(HostAllocator, config))
    }
}

impl BuddySubject<DeviceAllocator> {
    pub fn device(capacity: usize, config: ChunkConfig) -> Self {
        let backend = DeviceAllocator::new(0, capacity);
        BuddySubject(BuddyAllocator::new(backend, config))
    }
}

impl<B: BackingAllocator> BuddySubject<B> {
    pub fn allocator(&self) -> &BuddyAllocator<B> {
        &self.0
    }
}

impl<B: BackingAllocator> Subject for BuddySubject<B> {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        let res = self.0.allocate(size);
        self.0.validate();
        res
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.0.deallocate(ptr);
        self.0.validate();
    }

    fn used(&self) -> usize {
        self.0.used()
    }
}

/// A `LockedBuddyAllocator` under evaluation, driven through its shared
/// interface.
pub struct LockedSubject(LockedBuddyAllocator<HostAllocator>);

impl LockedSubject {
    pub fn new(config: ChunkConfig) -> Self {
        LockedSubject(LockedBuddyAllocator::new(HostAllocator, config))
    }
}

impl Subject for LockedSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.0.deallocate(ptr);
    }

    fn used(&self) -> usize {
        self.0.used()
    }
}
