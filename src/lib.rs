//! Buddy-system pool allocators for coarse-grained memory arenas.
//!
//! Acquiring memory from the host heap or from a device is expensive: calls
//! may be slow, limited in number, or synchronize the device. The allocators
//! in this crate acquire large *batches* from a [`BackingAllocator`] and serve
//! smaller requests by recursively halving those batches. Freed blocks are
//! coalesced with their buddies so that fragmentation stays bounded.
//!
//! The main entry points are:
//! - [`BuddyAllocator`], the unsynchronized engine;
//! - [`LockedBuddyAllocator`], the same engine behind a single lock;
//! - [`Registry`], which lazily constructs one locked engine for the host and
//!   one per device.
//!
//! ```
//! use acid_pool::{BuddyAllocator, ChunkConfig, HostAllocator};
//!
//! let config = ChunkConfig::new(64, 4096).unwrap();
//! let mut pool = BuddyAllocator::new(HostAllocator, config);
//!
//! let block = pool.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//! assert_eq!(pool.used(), 128);
//!
//! pool.deallocate(block.cast());
//! assert_eq!(pool.used(), 0);
//! ```

#![doc(html_root_url = "https://docs.rs/acid_pool/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods which are inherent on
// newer toolchains.
#![allow(unstable_name_collisions)]

extern crate alloc;

mod base;
mod meta;
mod pool;

pub mod backend;
pub mod buddy;
pub mod config;
pub mod registry;


use core::fmt;

pub use crate::{
    backend::{BackingAllocator, HostAllocator, Placement},
    buddy::{BuddyAllocator, BuddyStats, LockedBuddyAllocator},
    config::ChunkConfig,
    registry::{Registry, RegistryConfig},
};

#[cfg(feature = "device")]
pub use crate::{backend::DeviceAllocator, registry::DeviceConfig};

/// Indicates that an allocation request could not be satisfied.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// A zero-sized allocation was requested.
    ///
    /// Zero-sized requests are rejected before any allocator state is touched.
    ZeroSize,

    /// The backing allocator could not provide the memory needed to satisfy a
    /// request of `size` bytes.
    OutOfMemory {
        /// The number of bytes that could not be acquired.
        size: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => f.write_str("zero-sized allocation requested"),
            AllocError::OutOfMemory { size } => {
                write!(f, "out of memory (requested {size:#x} bytes)")
            }
        }
    }
}

/// The error type for allocator constructors.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AllocInitError {
    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration parameters
    /// are impossible to satisfy.
    InvalidConfig,

    /// No device with the given index is configured.
    NoSuchDevice(usize),
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::NoSuchDevice(id) => write!(f, "no such device: {id}"),
        }
    }
}
