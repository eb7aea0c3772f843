//! The Scatter creation policy.

use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::{debug, info, trace, warn};

use super::config::ScatterConfig;
use super::probe::BoundedProbe;
use super::size_class::SizeClasses;
use super::slab_table::{Reservation, SlabTable};
#[cfg(feature = "tracking")]
use super::stats::{HeapCounters, HeapStats};
use crate::{align_up, AllocError, AllocResult, CreationPolicy, ThreadContext};

/// Workers sharing one start slab, the width of a GPU warp.
const WARP_SHIFT: u32 = 5;
/// Multiplier scattering warps over the slab table.
const HASH_WARP: usize = 38183;
/// Multiplier separating size classes of the same warp.
const HASH_CLASS: usize = 17497;

#[inline]
fn start_slab(thread_id: usize, class: usize) -> usize {
    (thread_id >> WARP_SHIFT)
        .wrapping_mul(HASH_WARP)
        .wrapping_add(class.wrapping_mul(HASH_CLASS))
}

struct Heap {
    /// First slab address, aligned to the smallest slice.
    base: usize,
    /// Bytes covered by slabs.
    bytes: usize,
    table: SlabTable,
}

impl Heap {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.bytes
    }
}

/// Lock-free slab engine with lazily assigned size classes.
pub struct Scatter {
    config: ScatterConfig,
    classes: SizeClasses,
    heap: Option<Heap>,
    #[cfg(feature = "tracking")]
    counters: HeapCounters,
}

impl Scatter {
    /// An engine without a heap. Fails with [`AllocError::InvalidParam`] for an
    /// invalid `config`.
    pub fn new(config: ScatterConfig) -> AllocResult<Self> {
        config.validate()?;
        Ok(Self {
            classes: SizeClasses::new(config.smallest_slice, config.largest_slice),
            config,
            heap: None,
            #[cfg(feature = "tracking")]
            counters: HeapCounters::default(),
        })
    }

    pub fn config(&self) -> &ScatterConfig {
        &self.config
    }

    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Number of slabs, zero before `init_heap`.
    pub fn slab_count(&self) -> usize {
        self.heap.as_ref().map_or(0, |heap| heap.table.len())
    }

    /// Bytes covered by slabs.
    pub fn heap_bytes(&self) -> usize {
        self.heap.as_ref().map_or(0, |heap| heap.bytes)
    }

    /// Slot size currently served by `slab`.
    pub fn slab_slot_size(&self, slab: usize) -> Option<usize> {
        let heap = self.heap.as_ref()?;
        if slab >= heap.table.len() {
            return None;
        }
        heap.table.class_of(slab).map(|class| self.classes.size(class))
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> HeapStats {
        self.counters.snapshot()
    }

    #[inline]
    fn capacity(&self, class: usize) -> usize {
        self.config.slab_bytes / self.classes.size(class)
    }

    /// Slab, slot index and slot size of `addr`, which must lie in the heap.
    fn locate(&self, heap: &Heap, addr: usize) -> Option<(usize, usize, usize)> {
        let offset = addr - heap.base;
        let slab = offset / self.config.slab_bytes;
        let class = heap.table.class_of(slab)?;
        let slot_size = self.classes.size(class);
        Some((slab, (offset % self.config.slab_bytes) / slot_size, slot_size))
    }
}

impl Default for Scatter {
    fn default() -> Self {
        let config = ScatterConfig::default();
        Self {
            classes: SizeClasses::new(config.smallest_slice, config.largest_slice),
            config,
            heap: None,
            #[cfg(feature = "tracking")]
            counters: HeapCounters::default(),
        }
    }
}

impl CreationPolicy for Scatter {
    const PROVIDES_AVAILABLE_SLOTS: bool = true;

    fn init_heap(&mut self, base: NonNull<u8>, bytes: usize) -> AllocResult {
        if bytes == 0 {
            debug!("scatter: zero-byte heap, initialization skipped");
            return Ok(());
        }
        if self.heap.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }

        let start = base.as_ptr() as usize;
        let aligned = align_up(start, self.config.smallest_slice);
        let usable = bytes.saturating_sub(aligned - start);
        let slab_count = usable / self.config.slab_bytes;
        if slab_count == 0 {
            warn!(
                "scatter: {} bytes at {:#x} cannot hold a {}-byte slab",
                bytes, start, self.config.slab_bytes
            );
            return Err(AllocError::PoolTooSmall);
        }

        let heap = Heap {
            base: aligned,
            bytes: slab_count * self.config.slab_bytes,
            table: SlabTable::new(slab_count, self.config.max_slots_per_slab()),
        };
        info!(
            "scatter: {} slabs of {} bytes at [{:#x}, {:#x}), slots {}..={} bytes",
            slab_count,
            self.config.slab_bytes,
            heap.base,
            heap.base + heap.bytes,
            self.classes.smallest(),
            self.classes.largest()
        );
        self.heap = Some(heap);
        Ok(())
    }

    fn reset_heap(&mut self) {
        if self.heap.take().is_some() {
            debug!("scatter: heap reset");
        }
        #[cfg(feature = "tracking")]
        self.counters.reset();
    }

    fn is_initialized(&self) -> bool {
        self.heap.is_some()
    }

    fn create<T: ThreadContext + ?Sized>(&self, ctx: &T, bytes: usize) -> *mut u8 {
        let Some(heap) = self.heap.as_ref() else {
            return ptr::null_mut();
        };
        let Some(class) = self.classes.for_request(bytes) else {
            if bytes > self.classes.largest() {
                debug!(
                    "scatter: request of {} bytes exceeds largest slice {}",
                    bytes,
                    self.classes.largest()
                );
                #[cfg(feature = "tracking")]
                HeapCounters::bump(&self.counters.oversized_requests);
            }
            return ptr::null_mut();
        };

        let slot_size = self.classes.size(class);
        let capacity = self.capacity(class);
        let thread_id = ctx.thread_id();
        let probe = BoundedProbe::new(
            start_slab(thread_id, class),
            heap.table.len(),
            self.config.probe_limit,
        );

        for slab in probe {
            match heap.table.reserve(slab, class, capacity) {
                Reservation::Refused => continue,
                Reservation::Contended => {
                    #[cfg(feature = "tracking")]
                    HeapCounters::bump(&self.counters.contended_probes);
                    continue;
                }
                Reservation::Granted { assigned } => {
                    if assigned {
                        trace!("scatter: slab {} assigned to {}-byte slots", slab, slot_size);
                        #[cfg(feature = "tracking")]
                        HeapCounters::bump(&self.counters.slab_assignments);
                    }
                    if let Some(slot) = heap.table.claim_bit(slab, capacity, thread_id) {
                        #[cfg(feature = "tracking")]
                        HeapCounters::bump(&self.counters.creates);
                        let addr = heap.base + slab * self.config.slab_bytes + slot * slot_size;
                        return addr as *mut u8;
                    }
                    #[cfg(feature = "tracking")]
                    HeapCounters::bump(&self.counters.contended_probes);
                    if heap.table.release(slab, self.config.reclaim) {
                        #[cfg(feature = "tracking")]
                        HeapCounters::bump(&self.counters.slab_reclaims);
                    }
                }
            }
        }

        #[cfg(feature = "tracking")]
        HeapCounters::bump(&self.counters.failed_creates);
        ptr::null_mut()
    }

    unsafe fn destroy<T: ThreadContext + ?Sized>(&self, _ctx: &T, ptr: *mut u8) {
        let Some(heap) = self.heap.as_ref() else {
            warn!("scatter: free of {:p} without a heap", ptr);
            return;
        };
        let addr = ptr as usize;
        if !heap.contains(addr) {
            warn!("scatter: free of {:p} outside the heap", ptr);
            #[cfg(feature = "tracking")]
            HeapCounters::bump(&self.counters.invalid_frees);
            return;
        }
        let Some((slab, slot, _)) = self.locate(heap, addr) else {
            warn!("scatter: free of {:p} in unassigned slab", ptr);
            #[cfg(feature = "tracking")]
            HeapCounters::bump(&self.counters.invalid_frees);
            return;
        };

        if !heap.table.clear_bit(slab, slot) {
            warn!("scatter: double free of slot {} in slab {} ({:p})", slot, slab, ptr);
            #[cfg(feature = "tracking")]
            HeapCounters::bump(&self.counters.invalid_frees);
            return;
        }
        #[cfg(feature = "tracking")]
        HeapCounters::bump(&self.counters.destroys);

        if heap.table.release(slab, self.config.reclaim) {
            trace!("scatter: slab {} emptied and released", slab);
            #[cfg(feature = "tracking")]
            HeapCounters::bump(&self.counters.slab_reclaims);
        }
    }

    fn available_slots(&self, slot_size: usize) -> usize {
        let (Some(heap), Some(class)) = (self.heap.as_ref(), self.classes.for_request(slot_size))
        else {
            return 0;
        };
        let capacity = self.capacity(class);
        (0..heap.table.len())
            .map(|slab| match heap.table.snapshot(slab) {
                (None, _) => capacity,
                (Some(c), fill) if c == class => capacity.saturating_sub(fill),
                _ => 0,
            })
            .sum()
    }

    fn slot_base(&self, ptr: *mut u8) -> *mut u8 {
        let Some(heap) = self.heap.as_ref() else {
            return ptr::null_mut();
        };
        let addr = ptr as usize;
        if !heap.contains(addr) {
            return ptr::null_mut();
        }
        match self.locate(heap, addr) {
            Some((_, _, slot_size)) => {
                let offset = addr - heap.base;
                (heap.base + offset - offset % slot_size) as *mut u8
            }
            None => ptr::null_mut(),
        }
    }

    fn max_request(&self) -> usize {
        self.classes.largest()
    }

    fn classname() -> &'static str {
        "Scatter"
    }
}
