//! Usage counters of the Scatter engine, compiled in with the `tracking` feature.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub creates: usize,
    pub destroys: usize,
    pub failed_creates: usize,
    pub oversized_requests: usize,
    pub slab_assignments: usize,
    pub slab_reclaims: usize,
    pub contended_probes: usize,
    pub invalid_frees: usize,
}

impl HeapStats {
    /// Slots handed out and not yet returned.
    pub fn live(&self) -> usize {
        self.creates.saturating_sub(self.destroys)
    }
}

#[derive(Debug, Default)]
pub(crate) struct HeapCounters {
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    pub failed_creates: AtomicUsize,
    pub oversized_requests: AtomicUsize,
    pub slab_assignments: AtomicUsize,
    pub slab_reclaims: AtomicUsize,
    pub contended_probes: AtomicUsize,
    pub invalid_frees: AtomicUsize,
}

impl HeapCounters {
    #[inline]
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HeapStats {
        HeapStats {
            creates: self.creates.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
            failed_creates: self.failed_creates.load(Ordering::Relaxed),
            oversized_requests: self.oversized_requests.load(Ordering::Relaxed),
            slab_assignments: self.slab_assignments.load(Ordering::Relaxed),
            slab_reclaims: self.slab_reclaims.load(Ordering::Relaxed),
            contended_probes: self.contended_probes.load(Ordering::Relaxed),
            invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.creates,
            &self.destroys,
            &self.failed_creates,
            &self.oversized_requests,
            &self.slab_assignments,
            &self.slab_reclaims,
            &self.contended_probes,
            &self.invalid_frees,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
