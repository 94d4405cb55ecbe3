//! Chunk-size configuration for buddy allocators.

use crate::AllocInitError;

/// Minimum chunk size used for host memory.
pub const HOST_MIN_CHUNK_SIZE: usize = 1 << 12;

/// Maximum chunk size used for host memory.
pub const HOST_MAX_CHUNK_SIZE: usize = 1 << 26;

/// Minimum chunk size used for device memory.
pub const DEVICE_MIN_CHUNK_SIZE: usize = 1 << 8;

/// Fraction of a device's capacity, as a power-of-two divisor, used for one
/// batch.
const DEVICE_BATCH_DIVISOR: usize = 32;

/// The chunk-size parameters of a buddy allocator.
///
/// These parameters are subject to the following invariants:
/// - `min_chunk_size` and `max_chunk_size` must be powers of two.
/// - `min_chunk_size` must not exceed `max_chunk_size`.
/// - If present, the retry floor lies between the two and is a power of two.
///
/// Requests are rounded up to a multiple of `min_chunk_size`. Pooled batches
/// are exactly `max_chunk_size` bytes, and requests larger than that bypass
/// the pool entirely.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ChunkConfig {
    min_chunk_size: usize,
    max_chunk_size: usize,
    retry_floor: Option<usize>,
}

impl ChunkConfig {
    /// Constructs a new `ChunkConfig`.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig)` if either size is not a
    /// power of two or if `min_chunk_size > max_chunk_size`.
    pub fn new(min_chunk_size: usize, max_chunk_size: usize) -> Result<Self, AllocInitError> {
        if !min_chunk_size.is_power_of_two()
            || !max_chunk_size.is_power_of_two()
            || min_chunk_size > max_chunk_size
        {
            log::warn!(
                "rejecting chunk config: min={:#x} max={:#x}",
                min_chunk_size,
                max_chunk_size
            );
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(ChunkConfig {
            min_chunk_size,
            max_chunk_size,
            retry_floor: None,
        })
    }

    /// Returns the default configuration for host memory.
    pub fn host() -> ChunkConfig {
        ChunkConfig {
            min_chunk_size: HOST_MIN_CHUNK_SIZE,
            max_chunk_size: HOST_MAX_CHUNK_SIZE,
            retry_floor: None,
        }
    }

    /// Returns the default configuration for a device with `capacity` bytes
    /// of memory.
    ///
    /// Each batch takes at most a thirty-second of the device, rounded down to
    /// a power of two, but never less than the minimum chunk size.
    pub fn device(capacity: usize) -> ChunkConfig {
        let share = capacity / DEVICE_BATCH_DIVISOR;
        let max_chunk_size = match share.checked_ilog2() {
            Some(log) => 1 << log,
            None => DEVICE_MIN_CHUNK_SIZE,
        };

        ChunkConfig {
            min_chunk_size: DEVICE_MIN_CHUNK_SIZE,
            max_chunk_size: max_chunk_size.max(DEVICE_MIN_CHUNK_SIZE),
            retry_floor: None,
        }
    }

    /// Configures a retry floor.
    ///
    /// When acquiring a full batch fails, the allocator retries once with a
    /// smaller batch of at least `floor` bytes. `floor` is rounded up to a
    /// power of two.
    ///
    /// # Errors
    ///
    /// Returns `Err(AllocInitError::InvalidConfig)` if the rounded floor is
    /// outside `[min_chunk_size, max_chunk_size]`.
    pub fn with_retry_floor(self, floor: usize) -> Result<Self, AllocInitError> {
        let floor = floor
            .checked_next_power_of_two()
            .ok_or(AllocInitError::InvalidConfig)?;

        if floor < self.min_chunk_size || floor > self.max_chunk_size {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(ChunkConfig {
            retry_floor: Some(floor),
            ..self
        })
    }

    /// Returns the minimum chunk size.
    #[inline]
    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    /// Returns the maximum chunk size.
    #[inline]
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Returns the retry floor, if one is configured.
    #[inline]
    pub fn retry_floor(&self) -> Option<usize> {
        self.retry_floor
    }

    /// Returns whether a request of `size` bytes is served outside the pool.
    #[inline]
    pub fn is_oversize(&self, size: usize) -> bool {
        size > self.max_chunk_size
    }

    /// Rounds `size` up to a multiple of the minimum chunk size.
    ///
    /// Returns `None` on overflow.
    #[inline]
    pub fn round_up(&self, size: usize) -> Option<usize> {
        let mask = self.min_chunk_size - 1;
        size.checked_add(mask).map(|s| s & !mask)
    }

    /// Returns the size of the block that serves a pooled request of `size`
    /// bytes: the smallest power of two which is at least `size` and at least
    /// the minimum chunk size.
    #[inline]
    pub(crate) fn block_size_for(&self, size: usize) -> usize {
        debug_assert!(size <= self.max_chunk_size);

        size.next_power_of_two().max(self.min_chunk_size)
    }

    /// Returns the batch size to retry with after a full batch of
    /// `max_chunk_size` bytes could not be acquired for a request of `size`
    /// bytes.
    ///
    /// Returns `None` if no retry floor is configured or if the retry would not
    /// be strictly smaller than a full batch.
    pub(crate) fn retry_size_for(&self, size: usize) -> Option<usize> {
        let floor = self.retry_floor?;
        let retry = floor.max(self.block_size_for(size));

        (retry < self.max_chunk_size).then(|| retry)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllocInitError::InvalidConfig;

    #[test]
    fn rejects_non_powers_of_two() {
        assert_eq!(ChunkConfig::new(48, 4096), Err(InvalidConfig));
        assert_eq!(ChunkConfig::new(64, 4000), Err(InvalidConfig));
        assert_eq!(ChunkConfig::new(0, 4096), Err(InvalidConfig));
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert_eq!(ChunkConfig::new(8192, 4096), Err(InvalidConfig));
        assert!(ChunkConfig::new(4096, 4096).is_ok());
    }

    #[test]
    fn rounds_to_min_chunk_granularity() {
        let cfg = ChunkConfig::new(64, 4096).unwrap();

        assert_eq!(cfg.round_up(1), Some(64));
        assert_eq!(cfg.round_up(64), Some(64));
        assert_eq!(cfg.round_up(65), Some(128));
        assert_eq!(cfg.round_up(usize::MAX), None);
        assert_eq!(cfg.block_size_for(192), 256);
    }

    #[test]
    fn oversize_threshold_is_strict() {
        let cfg = ChunkConfig::new(64, 4096).unwrap();

        assert!(!cfg.is_oversize(4096));
        assert!(cfg.is_oversize(4097));
    }

    #[test]
    fn retry_floor_bounds() {
        let cfg = ChunkConfig::new(64, 4096).unwrap();

        assert_eq!(cfg.with_retry_floor(32), Err(InvalidConfig));
        assert_eq!(cfg.with_retry_floor(8192), Err(InvalidConfig));
        assert_eq!(cfg.with_retry_floor(600).unwrap().retry_floor(), Some(1024));
    }

    #[test]
    fn retry_size_is_strictly_smaller() {
        let cfg = ChunkConfig::new(64, 4096)
            .unwrap()
            .with_retry_floor(512)
            .unwrap();

        assert_eq!(cfg.retry_size_for(64), Some(512));
        assert_eq!(cfg.retry_size_for(1024), Some(1024));
        assert_eq!(cfg.retry_size_for(4096), None);
        assert_eq!(ChunkConfig::new(64, 4096).unwrap().retry_size_for(64), None);
    }

    #[test]
    fn device_preset_scales_with_capacity() {
        let cfg = ChunkConfig::device(1 << 30);
        assert_eq!(cfg.min_chunk_size(), DEVICE_MIN_CHUNK_SIZE);
        assert_eq!(cfg.max_chunk_size(), 1 << 25);

        let tiny = ChunkConfig::device(100);
        assert_eq!(tiny.max_chunk_size(), DEVICE_MIN_CHUNK_SIZE);

        let odd = ChunkConfig::device(3 << 20);
        assert_eq!(odd.max_chunk_size(), 1 << 16);
    }
}
