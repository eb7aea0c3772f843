//! Worker thread contexts.
//!
//! Every allocator operation receives the calling worker's context. It carries the
//! worker's identity, used to spread traffic over slabs, and the collective
//! operations of its cooperating group (a warp or workgroup on a GPU).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Barrier;

/// Per-worker execution handle.
///
/// The defaults describe a group of one lane, where every collective is trivial.
pub trait ThreadContext {
    /// Linear index of the worker, unique among concurrently running workers.
    fn thread_id(&self) -> usize;

    /// Index of the worker inside its group.
    fn lane(&self) -> usize {
        0
    }

    /// Number of lanes that execute collectives together.
    fn group_size(&self) -> usize {
        1
    }

    /// Group-wide exclusive prefix sum of `value`.
    ///
    /// Returns the sum over lower lanes and the sum over the whole group, both
    /// saturating at `usize::MAX`. Every lane of the group must call it.
    fn exclusive_sum(&self, value: usize) -> (usize, usize) {
        (0, value)
    }

    /// Hand `value` of lane `from_lane` to every lane. Every lane must call it.
    fn broadcast(&self, value: usize, from_lane: usize) -> usize {
        let _ = from_lane;
        value
    }
}

/// A worker that cooperates with nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoloContext {
    id: usize,
}

impl SoloContext {
    pub const fn new(id: usize) -> Self {
        Self { id }
    }
}

impl ThreadContext for SoloContext {
    fn thread_id(&self) -> usize {
        self.id
    }
}

/// Shared exchange area of an emulated warp.
///
/// Lanes run on independent threads and meet at each collective through a spin
/// barrier, which stands in for the implicit synchronization of lanes executing in
/// lockstep on a GPU.
pub struct LockstepGroup {
    first_thread: usize,
    slots: Box<[AtomicUsize]>,
    barrier: Barrier,
}

impl LockstepGroup {
    /// A group of `size` lanes whose thread ids start at `first_thread`.
    pub fn new(first_thread: usize, size: usize) -> Self {
        assert!(size > 0, "a lockstep group needs at least one lane");
        let slots: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();
        Self {
            first_thread,
            slots: slots.into_boxed_slice(),
            barrier: Barrier::new(size),
        }
    }

    /// Number of lanes.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Context of lane `lane`. Each lane must be driven by exactly one thread.
    pub fn lane(&self, lane: usize) -> GroupLane<'_> {
        assert!(lane < self.size(), "lane {} outside group of {}", lane, self.size());
        GroupLane { group: self, lane }
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}

/// One lane of a [`LockstepGroup`].
#[derive(Clone, Copy)]
pub struct GroupLane<'a> {
    group: &'a LockstepGroup,
    lane: usize,
}

impl ThreadContext for GroupLane<'_> {
    fn thread_id(&self) -> usize {
        self.group.first_thread + self.lane
    }

    fn lane(&self) -> usize {
        self.lane
    }

    fn group_size(&self) -> usize {
        self.group.size()
    }

    fn exclusive_sum(&self, value: usize) -> (usize, usize) {
        let group = self.group;
        group.slots[self.lane].store(value, Ordering::Relaxed);
        group.barrier();
        // Sums saturate at `usize::MAX`, which no creation policy can serve.
        let mut prefix = 0usize;
        let mut total = 0usize;
        for (lane, slot) in group.slots.iter().enumerate() {
            let v = slot.load(Ordering::Relaxed);
            if lane < self.lane {
                prefix = prefix.saturating_add(v);
            }
            total = total.saturating_add(v);
        }
        // Nobody may overwrite a slot before every lane has read it.
        group.barrier();
        (prefix, total)
    }

    fn broadcast(&self, value: usize, from_lane: usize) -> usize {
        let group = self.group;
        if self.lane == from_lane {
            group.slots[from_lane].store(value, Ordering::Relaxed);
        }
        group.barrier();
        let v = group.slots[from_lane].load(Ordering::Relaxed);
        group.barrier();
        v
    }
}
