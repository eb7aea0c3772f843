//! Construction-time parameters of the Scatter engine.

use crate::{AllocError, AllocResult};

/// Smallest slot size that still fits a distribution header word.
pub const MIN_SLICE: usize = 8;

/// What happens to a slab once its last slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reclaim {
    /// The slab drops its size class and may serve any class next.
    #[default]
    Release,
    /// The slab keeps its size class for the lifetime of the heap.
    Retain,
}

/// Construction-time parameters of [`Scatter`](super::Scatter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterConfig {
    /// Bytes per slab.
    pub slab_bytes: usize,
    /// Smallest slot size.
    pub smallest_slice: usize,
    /// Largest slot size; bigger requests are refused.
    pub largest_slice: usize,
    /// Upper bound on slabs visited by one `create`.
    pub probe_limit: usize,
    /// What an emptied slab does.
    pub reclaim: Reclaim,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            slab_bytes: 0x1000,
            smallest_slice: 16,
            largest_slice: 0x1000,
            probe_limit: usize::MAX,
            reclaim: Reclaim::Release,
        }
    }
}

impl ScatterConfig {
    /// Bytes per slab, a power of two.
    pub const fn with_slab_bytes(mut self, slab_bytes: usize) -> Self {
        self.slab_bytes = slab_bytes;
        self
    }

    /// Smallest and largest slot size, both powers of two.
    pub const fn with_slices(mut self, smallest: usize, largest: usize) -> Self {
        self.smallest_slice = smallest;
        self.largest_slice = largest;
        self
    }

    /// Slabs a single `create` may visit, at least one.
    pub const fn with_probe_limit(mut self, probe_limit: usize) -> Self {
        self.probe_limit = probe_limit;
        self
    }

    /// Fate of a slab whose last slot is freed.
    pub const fn with_reclaim(mut self, reclaim: Reclaim) -> Self {
        self.reclaim = reclaim;
        self
    }

    /// Maximum number of slots in one slab, reached by the smallest class.
    pub const fn max_slots_per_slab(&self) -> usize {
        self.slab_bytes / self.smallest_slice
    }

    /// Checks the shape of the configuration.
    ///
    /// Returns [`AllocError::InvalidParam`] unless every size is a power of two,
    /// `MIN_SLICE <= smallest <= largest <= slab_bytes`, a slab holds at most
    /// `u32::MAX` slots and the probe limit is non-zero.
    pub fn validate(&self) -> AllocResult {
        let sizes_ok = self.slab_bytes.is_power_of_two()
            && self.smallest_slice.is_power_of_two()
            && self.largest_slice.is_power_of_two();
        if !sizes_ok
            || self.smallest_slice < MIN_SLICE
            || self.smallest_slice > self.largest_slice
            || self.largest_slice > self.slab_bytes
            || self.max_slots_per_slab() > u32::MAX as usize
            || self.probe_limit == 0
        {
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }
}
