//! Concurrency tests
//!
//! Many threads hammer one allocator; slots must never be handed out twice.

use std::sync::Barrier;
use std::thread;

use device_slab_allocator::{
    Allocator, CreationPolicy, LockstepGroup, Noop, RecordFailure, Scatter, ScatterConfig,
    SoloContext, ThreadContext, WarpCoalesce,
};

const SLAB_SIZE: usize = 0x1000;

/// Small deterministic generator, one per thread.
struct XorShift(u64);

impl XorShift {
    fn new(seed: usize) -> Self {
        Self((seed as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> usize {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x as usize
    }
}

fn fill(ptr: *mut u8, bytes: usize, tag: u8) {
    unsafe { ptr.write_bytes(tag, bytes) };
}

fn check(ptr: *mut u8, bytes: usize, tag: u8) {
    let block = unsafe { std::slice::from_raw_parts(ptr, bytes) };
    assert!(
        block.iter().all(|&b| b == tag),
        "block at {:p} was overwritten by another thread",
        ptr
    );
}

#[test]
fn test_200_concurrent_creates_on_one_slab() {
    let mut allocator: Allocator = Allocator::with_config(ScatterConfig::default()).unwrap();
    allocator.init(None, SLAB_SIZE).unwrap();
    let allocator = &allocator;
    let start = Barrier::new(200);

    let mut ptrs: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..200)
            .map(|id| {
                let start = &start;
                s.spawn(move || {
                    let ctx = SoloContext::new(id);
                    start.wait();
                    allocator.malloc(&ctx, 16) as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(ptrs.iter().all(|&p| p != 0), "a create lost to contention");
    ptrs.sort_unstable();
    ptrs.dedup();
    assert_eq!(ptrs.len(), 200);

    // The 201st through 256th still fit
    let ctx = SoloContext::new(0);
    for _ in 200..256 {
        let p = allocator.malloc(&ctx, 16);
        assert!(!p.is_null());
        ptrs.push(p as usize);
    }
    let extra = allocator.malloc(&ctx, 16);
    assert!(extra.is_null());
    assert!(allocator.is_oom(extra, 16));

    unsafe { allocator.free(&ctx, ptrs[42] as *mut u8) };
    assert_eq!(allocator.malloc(&ctx, 16) as usize, ptrs[42]);

    ptrs.sort_unstable();
    ptrs.dedup();
    assert_eq!(ptrs.len(), 256);
}

#[test]
fn test_concurrent_exhaustion_hands_out_exactly_capacity() {
    let mut heap = Scatter::default();
    let layout = std::alloc::Layout::from_size_align(SLAB_SIZE, SLAB_SIZE).unwrap();
    let base = std::ptr::NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
    heap.init_heap(base, SLAB_SIZE).unwrap();
    let heap = &heap;
    let start = Barrier::new(16);

    // 16 threads race for 256 slots with 20 requests each
    let counts: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let start = &start;
                s.spawn(move || {
                    let ctx = SoloContext::new(t * 32);
                    start.wait();
                    (0..20)
                        .filter(|_| !heap.create(&ctx, 16).is_null())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(counts.iter().sum::<usize>(), 256);
    assert_eq!(heap.available_slots(16), 0);

    unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
}

#[test]
fn test_no_overlap_under_churn() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2000;

    let mut allocator: Allocator = Allocator::default();
    allocator.init(None, 64 * SLAB_SIZE).unwrap();
    let allocator = &allocator;

    let served: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                s.spawn(move || {
                    let ctx = SoloContext::new(t * 40);
                    let tag = t as u8 + 1;
                    let mut rng = XorShift::new(t);
                    let mut live: Vec<(*mut u8, usize)> = Vec::new();
                    let mut served = 0;

                    for _ in 0..ROUNDS {
                        if live.len() < 16 && rng.next() % 3 != 0 {
                            let bytes = 1 + rng.next() % 1024;
                            let p = allocator.malloc(&ctx, bytes);
                            if !p.is_null() {
                                fill(p, bytes, tag);
                                live.push((p, bytes));
                                served += 1;
                            }
                        } else if !live.is_empty() {
                            let (p, bytes) = live.swap_remove(rng.next() % live.len());
                            check(p, bytes, tag);
                            unsafe { allocator.free(&ctx, p) };
                        }
                    }
                    for (p, bytes) in live {
                        check(p, bytes, tag);
                        unsafe { allocator.free(&ctx, p) };
                    }
                    served
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert!(served > THREADS * ROUNDS / 4);
    // Every slab emptied and returned to the unassigned pool
    assert_eq!(allocator.available_slots(4096), 64);
}

#[test]
fn test_class_changes_under_contention() {
    const THREADS: usize = 8;

    // Four slabs fought over by tiny and page-sized requests
    let mut allocator: Allocator = Allocator::default();
    allocator.init(None, 4 * SLAB_SIZE).unwrap();
    let allocator = &allocator;

    thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                let ctx = SoloContext::new(t * 32);
                let tag = 0xA0 + t as u8;
                for round in 0..3000 {
                    let bytes = if (round + t) % 2 == 0 { 16 } else { 2048 };
                    let p = allocator.malloc(&ctx, bytes);
                    if p.is_null() {
                        continue;
                    }
                    fill(p, bytes, tag);
                    std::hint::spin_loop();
                    check(p, bytes, tag);
                    unsafe { allocator.free(&ctx, p) };
                }
            });
        }
    });

    assert_eq!(allocator.available_slots(4096), 4);
    for slab in 0..4 {
        assert_eq!(allocator.creation().slab_slot_size(slab), None);
    }
}

#[test]
fn test_warp_groups_share_blocks() {
    const GROUPS: usize = 2;
    const LANES: usize = 4;
    const ROUNDS: usize = 100;

    let mut allocator: Allocator<Scatter, WarpCoalesce> = Allocator::default();
    allocator.init(None, 16 * SLAB_SIZE).unwrap();
    let allocator = &allocator;
    let groups: Vec<LockstepGroup> = (0..GROUPS)
        .map(|g| LockstepGroup::new(g * 32, LANES))
        .collect();

    thread::scope(|s| {
        for group in &groups {
            for lane in 0..LANES {
                s.spawn(move || {
                    let ctx = group.lane(lane);
                    let tag = ctx.thread_id() as u8 + 1;
                    let mut held = Vec::new();
                    for round in 0..ROUNDS {
                        // Some lanes sit out some rounds but still join the collective
                        let bytes = if (round + lane) % 3 == 0 { 0 } else { 8 * (lane + 1) };
                        let p = allocator.malloc(&ctx, bytes);
                        if bytes == 0 {
                            assert!(p.is_null());
                            continue;
                        }
                        assert!(!p.is_null());
                        fill(p, bytes, tag);
                        held.push((p, bytes));
                        if held.len() == 4 {
                            for (p, bytes) in held.drain(..) {
                                check(p, bytes, tag);
                                unsafe { allocator.free(&ctx, p) };
                            }
                        }
                    }
                    for (p, bytes) in held {
                        check(p, bytes, tag);
                        unsafe { allocator.free(&ctx, p) };
                    }
                });
            }
        }
    });

    // The last lane out of every shared block returned it
    assert_eq!(allocator.available_slots(4096), 16);
}

#[test]
fn test_churn_below_capacity_never_fails() {
    const THREADS: usize = 8;

    // Eight threads never hold more than 16 of the 256 slots
    let mut allocator: Allocator = Allocator::default();
    allocator.init(None, SLAB_SIZE).unwrap();
    let allocator = &allocator;
    let start = Barrier::new(THREADS);

    thread::scope(|s| {
        for t in 0..THREADS {
            let start = &start;
            s.spawn(move || {
                let ctx = SoloContext::new(t);
                start.wait();
                for round in 0..5000 {
                    let a = allocator.malloc(&ctx, 16);
                    let b = allocator.malloc(&ctx, 16);
                    assert!(!a.is_null() && !b.is_null(), "round {} failed", round);
                    unsafe {
                        allocator.free(&ctx, a);
                        allocator.free(&ctx, b);
                    }
                }
            });
        }
    });

    assert_eq!(allocator.available_slots(4096), 1);
}

fn group_malloc<O>(
    allocator: &Allocator<Scatter, WarpCoalesce, O>,
    lanes: usize,
    bytes: impl Fn(usize) -> usize + Sync,
) -> Vec<usize>
where
    O: device_slab_allocator::OomPolicy + Sync,
{
    let group = LockstepGroup::new(0, lanes);
    thread::scope(|s| {
        let handles: Vec<_> = (0..lanes)
            .map(|lane| {
                let group = &group;
                let bytes = &bytes;
                s.spawn(move || {
                    let ctx = group.lane(lane);
                    allocator.malloc(&ctx, bytes(lane)) as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_warp_group_huge_requests_get_null() {
    let mut allocator: Allocator<Scatter, WarpCoalesce, RecordFailure> = Allocator::default();
    allocator.init(None, 4 * SLAB_SIZE).unwrap();

    let ptrs = group_malloc(&allocator, 2, |_| usize::MAX / 2 + 1);
    assert_eq!(ptrs, [0, 0]);
    let ptrs = group_malloc(&allocator, 2, |lane| (1 << 63) + lane * 64);
    assert_eq!(ptrs, [0, 0]);

    assert_eq!(allocator.oom().failures(), 4);
    assert_eq!(allocator.oom().largest_request(), (1 << 63) + 64);
    assert_eq!(allocator.available_slots(4096), 4);
}

#[test]
fn test_warp_group_shared_block_exhausted() {
    let mut allocator: Allocator<Scatter, WarpCoalesce, RecordFailure> = Allocator::default();
    allocator.init(None, SLAB_SIZE).unwrap();
    let solo = SoloContext::new(0);

    // 127 headed 16-byte blocks leave one 32-byte slot in the only slab
    let mut held = Vec::new();
    for _ in 0..127 {
        let p = allocator.malloc(&solo, 16);
        assert!(!p.is_null());
        held.push(p);
    }
    assert_eq!(allocator.available_slots(32), 1);

    // Each lane alone would fit, the 80-byte shared block does not
    let ptrs = group_malloc(&allocator, 4, |_| 16);
    assert_eq!(ptrs, [0, 0, 0, 0]);
    assert_eq!(allocator.oom().failures(), 4);
    assert_eq!(allocator.available_slots(32), 1);

    let p = allocator.malloc(&solo, 16);
    assert!(!p.is_null());
    held.push(p);
    for p in held {
        unsafe { allocator.free(&solo, p) };
    }
    assert_eq!(allocator.available_slots(4096), 1);
}

#[test]
fn test_noop_group_lanes_allocate_independently() {
    let mut allocator: Allocator<Scatter, Noop> = Allocator::default();
    allocator.init(None, SLAB_SIZE).unwrap();
    let group = LockstepGroup::new(0, 2);

    let ptrs: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|lane| {
                let group = &group;
                let allocator = &allocator;
                s.spawn(move || {
                    let bytes = if lane == 0 { 16 } else { usize::MAX };
                    allocator.malloc(&group.lane(lane), bytes) as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_ne!(ptrs[0], 0);
    assert_eq!(ptrs[1], 0);
}
