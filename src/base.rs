use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use sptr::Strict;

/// A pointer to the base of a batch acquired from a backing allocator.
///
/// Blocks inside the batch are addressed by their offset from this pointer.
/// Every pointer handed out for a block is derived from the base pointer, so
/// it carries the provenance of the whole batch.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`, covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if the end of the region overflows `usize`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        assert!(
            ptr.as_ptr().addr().checked_add(extent).is_some(),
            "region limit overflows usize"
        );

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        // SAFETY: `ptr` is non-null, so its address is nonzero.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.as_ptr().addr()) }
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the first address past the end of the region.
    #[inline]
    pub fn limit(self) -> usize {
        self.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: usize) -> bool {
        self.addr().get() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies below the base address.
    #[inline]
    pub fn offset_to(self, addr: usize) -> usize {
        let base = self.addr().get();
        addr.checked_sub(base).expect("address precedes batch base")
    }

    /// Creates a pointer to the byte `offset` bytes past the base, with the
    /// provenance of the base pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.extent);

        let addr = self.addr().get() + offset;

        // SAFETY: `addr` is at least the (nonzero) base address.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().with_addr(addr)) }
    }

    /// Creates a slice pointer covering `len` bytes starting `offset` bytes
    /// past the base.
    #[inline]
    pub fn with_offset_and_len(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset <= self.extent && len <= self.extent - offset);

        let raw_slice = ptr::slice_from_raw_parts_mut(self.with_offset(offset).as_ptr(), len);

        // SAFETY: the slice starts at a non-null pointer.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_at(addr: usize, extent: usize) -> BasePtr {
        let ptr = NonNull::new(sptr::invalid_mut::<u8>(addr)).unwrap();
        BasePtr::new(ptr, extent)
    }

    #[test]
    fn contains_is_half_open() {
        let base = base_at(0x1000, 0x100);

        assert!(!base.contains_addr(0xFFF));
        assert!(base.contains_addr(0x1000));
        assert!(base.contains_addr(0x10FF));
        assert!(!base.contains_addr(0x1100));
    }

    #[test]
    fn offsets_round_trip_through_addresses() {
        let base = base_at(0x4000, 0x1000);
        let block = base.with_offset(0x240);

        assert_eq!(block.as_ptr().addr(), 0x4240);
        assert_eq!(base.offset_to(block.as_ptr().addr()), 0x240);
        assert_eq!(base.with_offset_and_len(0x200, 0x40).len(), 0x40);
    }

    #[test]
    #[should_panic]
    fn offset_to_rejects_lower_addresses() {
        base_at(0x4000, 0x1000).offset_to(0x3FFF);
    }

    #[test]
    #[should_panic]
    fn overflowing_region_is_rejected() {
        base_at(usize::MAX - 8, 16);
    }
}
