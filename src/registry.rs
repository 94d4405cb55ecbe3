//! Lazily constructed allocators for the host and for each device.
//!
//! A [`Registry`] is built from a [`RegistryConfig`] during startup and owns
//! one [`LockedBuddyAllocator`] for host memory and, with the `device`
//! feature, one per configured device. Each allocator is constructed exactly
//! once, on first use, even when first used from several threads at once.
//!
//! Programs that want a single process-wide registry can [`install`] one and
//! reach it later through [`global`].

#[cfg(feature = "device")]
use alloc::vec::Vec;

use spin::Once;

use crate::{backend::HostAllocator, buddy::LockedBuddyAllocator, config::ChunkConfig};

#[cfg(feature = "device")]
use crate::{backend::DeviceAllocator, AllocInitError};

/// The configuration of one device.
#[cfg(feature = "device")]
#[cfg_attr(docs_rs, doc(cfg(feature = "device")))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DeviceConfig {
    /// Total memory of the device in bytes.
    pub capacity: usize,
    /// Chunk configuration of the device's allocator.
    pub chunks: ChunkConfig,
}

#[cfg(feature = "device")]
impl DeviceConfig {
    /// Describes a device with `capacity` bytes, using the default device
    /// chunk configuration for that capacity.
    pub fn new(capacity: usize) -> DeviceConfig {
        DeviceConfig {
            capacity,
            chunks: ChunkConfig::device(capacity),
        }
    }

    /// Replaces the chunk configuration.
    pub fn with_chunks(self, chunks: ChunkConfig) -> DeviceConfig {
        DeviceConfig { chunks, ..self }
    }
}

/// The configuration of a [`Registry`].
#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    /// Chunk configuration of the host allocator.
    pub host: ChunkConfig,
    /// One entry per device, indexed by device id.
    #[cfg(feature = "device")]
    #[cfg_attr(docs_rs, doc(cfg(feature = "device")))]
    pub devices: Vec<DeviceConfig>,
}

#[cfg(feature = "device")]
struct DeviceSlot {
    config: DeviceConfig,
    allocator: Once<LockedBuddyAllocator<DeviceAllocator>>,
}

/// A set of lazily constructed allocators, one for the host and one per
/// device.
pub struct Registry {
    host_config: ChunkConfig,
    host: Once<LockedBuddyAllocator<HostAllocator>>,
    #[cfg(feature = "device")]
    devices: Vec<DeviceSlot>,
}

impl Registry {
    /// Constructs a registry. No allocator is constructed until first use.
    pub fn new(config: RegistryConfig) -> Registry {
        Registry {
            host_config: config.host,
            host: Once::new(),
            #[cfg(feature = "device")]
            devices: config
                .devices
                .into_iter()
                .map(|config| DeviceSlot {
                    config,
                    allocator: Once::new(),
                })
                .collect(),
        }
    }

    /// Returns the host allocator, constructing it on first use.
    pub fn host(&self) -> &LockedBuddyAllocator<HostAllocator> {
        self.host.call_once(|| {
            log::debug!("constructing host allocator: {:?}", self.host_config);
            LockedBuddyAllocator::new(HostAllocator, self.host_config)
        })
    }

    /// Returns the number of configured devices.
    #[cfg(feature = "device")]
    #[cfg_attr(docs_rs, doc(cfg(feature = "device")))]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns the allocator for device `id`, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::NoSuchDevice(id))` if no device with that
    /// index is configured.
    #[cfg(feature = "device")]
    #[cfg_attr(docs_rs, doc(cfg(feature = "device")))]
    pub fn device(
        &self,
        id: usize,
    ) -> Result<&LockedBuddyAllocator<DeviceAllocator>, AllocInitError> {
        let slot = self.devices.get(id).ok_or(AllocInitError::NoSuchDevice(id))?;

        Ok(slot.allocator.call_once(|| {
            log::debug!(
                "constructing allocator for device {}: {:?}",
                id,
                slot.config
            );
            LockedBuddyAllocator::new(
                DeviceAllocator::new(id, slot.config.capacity),
                slot.config.chunks,
            )
        }))
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("Registry");
        s.field("host_config", &self.host_config)
            .field("host_initialized", &self.host.is_completed());

        #[cfg(feature = "device")]
        s.field("devices", &self.devices.len());

        s.finish()
    }
}

static GLOBAL: Once<Registry> = Once::new();

/// Installs the process-wide registry.
///
/// The first call wins; later calls leave the installed registry untouched
/// and return it.
pub fn install(config: RegistryConfig) -> &'static Registry {
    let mut installed = false;

    let registry = GLOBAL.call_once(|| {
        installed = true;
        Registry::new(config)
    });

    if !installed {
        log::warn!(
            "global registry already installed; ignoring new configuration"
        );
    }

    registry
}

/// Returns the process-wide registry, installing one with the default
/// configuration if none has been installed.
pub fn global() -> &'static Registry {
    GLOBAL.call_once(|| Registry::new(RegistryConfig::default()))
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{
        sync::{Arc, Barrier},
        thread,
        vec::Vec,
    };

    use super::*;

    fn small_host() -> RegistryConfig {
        RegistryConfig {
            host: ChunkConfig::new(64, 1 << 16).unwrap(),
            ..RegistryConfig::default()
        }
    }

    #[test]
    fn host_is_constructed_once() {
        let registry = Arc::new(Registry::new(small_host()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.host() as *const _ as usize)
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(addrs[0], registry.host() as *const _ as usize);
    }

    #[test]
    fn host_allocator_uses_configured_chunks() {
        let registry = Registry::new(small_host());
        let host = registry.host();

        let block = host.allocate(1).unwrap();
        assert_eq!(block.len(), 64);
        host.deallocate(block.cast());
        assert_eq!(host.used(), 0);
    }

    #[cfg(feature = "device")]
    #[test]
    fn devices_are_independent() {
        let config = RegistryConfig {
            devices: std::vec![DeviceConfig::new(1 << 20), DeviceConfig::new(1 << 22)],
            ..small_host()
        };
        let registry = Registry::new(config);
        assert_eq!(registry.device_count(), 2);

        let dev0 = registry.device(0).unwrap();
        let dev1 = registry.device(1).unwrap();
        assert!(!core::ptr::eq(dev0, dev1));
        assert!(core::ptr::eq(dev0, registry.device(0).unwrap()));

        let block = dev1.allocate(1000).unwrap();
        assert_eq!(dev1.used(), 1024);
        assert_eq!(dev0.used(), 0);
        assert_eq!(dev1.lock().backend().in_use(), 1 << 17);

        dev1.deallocate(block.cast());
    }

    #[cfg(feature = "device")]
    #[test]
    fn each_device_is_constructed_once() {
        const THREADS: usize = 8;

        let config = RegistryConfig {
            devices: std::vec![DeviceConfig::new(1 << 20), DeviceConfig::new(1 << 20)],
            ..small_host()
        };
        let registry = Arc::new(Registry::new(config));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let id = t % 2;
                    barrier.wait();

                    let dev = registry.device(id).unwrap();
                    let block = dev.allocate(256).unwrap();
                    dev.deallocate(block.cast());

                    (id, dev as *const _ as usize)
                })
            })
            .collect();

        let seen: Vec<(usize, usize)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for id in 0..2 {
            let dev = registry.device(id).unwrap();
            let addr = dev as *const _ as usize;
            assert!(seen.iter().filter(|s| s.0 == id).all(|s| s.1 == addr));

            let stats = dev.stats();
            assert_eq!(stats.used, 0);
            assert_eq!(stats.batches, 1);
            assert_eq!(dev.lock().backend().in_use(), 1 << 15);
        }

        assert_ne!(seen[0].1, seen[1].1);
    }

    #[cfg(feature = "device")]
    #[test]
    fn unknown_device_is_an_error() {
        let registry = Registry::new(small_host());
        assert_eq!(
            registry.device(3).map(|_| ()),
            Err(AllocInitError::NoSuchDevice(3))
        );
    }

    #[test]
    fn global_registry_installs_once() {
        let first = install(small_host());
        let second = install(RegistryConfig::default());

        assert!(core::ptr::eq(first, second));
        assert!(core::ptr::eq(first, global()));
        assert_eq!(first.host().lock().config().max_chunk_size(), 1 << 16);
    }
}
