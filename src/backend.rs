//! Backing allocators, which supply the large regions that buddy allocators
//! subdivide.

use core::{alloc::Layout, ptr::NonNull};

use crate::AllocError;

/// Alignment of regions acquired from the host heap.
pub const HOST_ALIGNMENT: usize = 1 << 12;

/// Alignment of regions acquired from a device heap.
#[cfg(feature = "device")]
pub const DEVICE_ALIGNMENT: usize = 1 << 8;

/// Where the memory supplied by a backing allocator lives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Placement {
    /// Host memory.
    Host,
    /// Memory owned by the device with the given index.
    Device(usize),
}

/// Types which provide the memory that backs a buddy allocator.
///
/// A buddy allocator calls [`acquire`] whenever its pool cannot satisfy a
/// request, and calls [`release`] for oversize regions as they are freed and
/// for every remaining region when it is dropped. Acquisition may be slow;
/// it is always performed with the allocator's lock held.
///
/// [`acquire`]: BackingAllocator::acquire
/// [`release`]: BackingAllocator::release
pub trait BackingAllocator {
    /// Acquires a region of exactly `size` bytes.
    ///
    /// `size` is never zero.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocError::OutOfMemory)` if the region cannot be provided.
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Releases a region previously returned by [`acquire`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to `acquire(size)` on this
    /// backing allocator, and must not have been released since.
    ///
    /// [`acquire`]: BackingAllocator::acquire
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);

    /// Returns where the acquired memory lives.
    fn placement(&self) -> Placement;
}

fn region_layout(size: usize, align: usize) -> Result<Layout, AllocError> {
    Layout::from_size_align(size, align).map_err(|_| AllocError::OutOfMemory { size })
}

/// A backing allocator that acquires regions from the global allocator.
#[derive(Copy, Clone, Default, Debug)]
pub struct HostAllocator;

impl BackingAllocator for HostAllocator {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let layout = region_layout(size, HOST_ALIGNMENT)?;

        // SAFETY: `size` is nonzero.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(AllocError::OutOfMemory { size })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        // The layout was valid when the region was acquired.
        let layout = unsafe { Layout::from_size_align_unchecked(size, HOST_ALIGNMENT) };

        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn placement(&self) -> Placement {
        Placement::Host
    }
}

/// A backing allocator for the memory of one device.
///
/// The device heap has a fixed capacity. Acquisitions that would exceed it
/// fail with [`AllocError::OutOfMemory`], as a device driver would. Regions
/// are carved from host memory aligned to [`DEVICE_ALIGNMENT`], so pointers
/// into them are only meaningful as opaque handles to device memory.
#[cfg(feature = "device")]
#[cfg_attr(docs_rs, doc(cfg(feature = "device")))]
#[derive(Clone, Debug)]
pub struct DeviceAllocator {
    device: usize,
    capacity: usize,
    in_use: usize,
}

#[cfg(feature = "device")]
impl DeviceAllocator {
    /// Constructs a backing allocator for device `device` with `capacity`
    /// bytes of memory.
    pub fn new(device: usize, capacity: usize) -> DeviceAllocator {
        DeviceAllocator {
            device,
            capacity,
            in_use: 0,
        }
    }

    /// Returns the index of the device.
    pub fn device(&self) -> usize {
        self.device
    }

    /// Returns the total capacity of the device in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes currently acquired from the device.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

#[cfg(feature = "device")]
impl BackingAllocator for DeviceAllocator {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let in_use = self
            .in_use
            .checked_add(size)
            .filter(|&total| total <= self.capacity)
            .ok_or(AllocError::OutOfMemory { size })?;

        let layout = region_layout(size, DEVICE_ALIGNMENT)?;

        // SAFETY: `size` is nonzero.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory { size })?;

        self.in_use = in_use;
        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let layout = unsafe { Layout::from_size_align_unchecked(size, DEVICE_ALIGNMENT) };

        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };

        self.in_use -= size;
    }

    fn placement(&self) -> Placement {
        Placement::Device(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_regions_are_page_aligned() {
        let mut host = HostAllocator;
        let ptr = host.acquire(3 * HOST_ALIGNMENT).unwrap();
        assert_eq!(ptr.as_ptr() as usize % HOST_ALIGNMENT, 0);
        unsafe { host.release(ptr, 3 * HOST_ALIGNMENT) };
    }

    #[test]
    fn host_rejects_unrepresentable_sizes() {
        assert_eq!(
            HostAllocator.acquire(usize::MAX),
            Err(AllocError::OutOfMemory { size: usize::MAX })
        );
    }

    #[cfg(feature = "device")]
    #[test]
    fn device_enforces_capacity() {
        let mut dev = DeviceAllocator::new(1, 4096);
        assert_eq!(dev.placement(), Placement::Device(1));

        let a = dev.acquire(3072).unwrap();
        assert_eq!(dev.in_use(), 3072);
        assert_eq!(
            dev.acquire(2048),
            Err(AllocError::OutOfMemory { size: 2048 })
        );

        let b = dev.acquire(1024).unwrap();
        assert_eq!(dev.in_use(), 4096);

        unsafe {
            dev.release(a, 3072);
            dev.release(b, 1024);
        }
        assert_eq!(dev.in_use(), 0);
    }
}
