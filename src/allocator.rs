//! Allocator facade.
//!
//! This module composes the five policies into one allocator: the reserve-pool
//! policy provides the memory, the alignment policy pads requests, the distribution
//! policy decides who calls into the creation policy, and the OOM policy decides
//! what a failed request returns.

extern crate alloc;

use alloc::format;
use alloc::string::String;
use core::alloc::{GlobalAlloc, Layout};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::{debug, error, info};

use crate::{
    AlignmentPolicy, AllocError, AllocResult, CreationPolicy, DeviceBuffer, DistributionPolicy,
    HostMemory, Noop, OomPolicy, ReservePoolPolicy, ReturnNull, Scatter, ScatterConfig, Shrink,
    SoloContext, ThreadContext,
};

/// Lifecycle of an [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapState {
    /// No pool; `malloc` fails and `free` is ignored.
    Uninitialized,
    /// Serving allocations.
    Ready,
}

/// Allocator composed of a creation, distribution, OOM, reserve-pool and alignment
/// policy.
///
/// Lifecycle operations take `&mut self` and are therefore serialized against
/// `malloc`/`free` traffic by the borrow checker; the allocator itself never locks.
pub struct Allocator<
    C = Scatter,
    D = Noop,
    O = ReturnNull,
    R = DeviceBuffer<HostMemory>,
    A = Shrink<16>,
> {
    creation: C,
    distribution: D,
    oom: O,
    reserve: R,
    ticket: AtomicUsize,
    state: HeapState,
    _alignment: PhantomData<A>,
}

impl<C, D, O, R, A> Allocator<C, D, O, R, A>
where
    C: CreationPolicy,
    D: DistributionPolicy,
    O: OomPolicy,
    R: ReservePoolPolicy,
    A: AlignmentPolicy,
{
    /// Composes the given policies. The allocator starts uninitialized.
    pub const fn new(creation: C, distribution: D, oom: O, reserve: R) -> Self {
        Self {
            creation,
            distribution,
            oom,
            reserve,
            ticket: AtomicUsize::new(0),
            state: HeapState::Uninitialized,
            _alignment: PhantomData,
        }
    }

    /// Reserve a pool of `bytes`, or adopt `existing`, and lay the heap over it.
    ///
    /// A zero-byte request does nothing and leaves the allocator uninitialized.
    pub fn init(&mut self, existing: Option<NonNull<u8>>, bytes: usize) -> AllocResult {
        if self.state == HeapState::Ready {
            return Err(AllocError::AlreadyInitialized);
        }
        let Some(region) = self.reserve.set_mem_pool(existing, bytes)? else {
            debug!("allocator: zero-byte init ignored");
            return Ok(());
        };
        let Some(aligned) = A::align_pool(region) else {
            self.reserve.reset_mem_pool();
            return Err(AllocError::PoolTooSmall);
        };
        if let Err(e) = self.creation.init_heap(aligned.base, aligned.bytes) {
            error!("allocator: heap setup over {} bytes failed: {}", aligned.bytes, e);
            self.reserve.reset_mem_pool();
            return Err(e);
        }

        self.state = HeapState::Ready;
        info!(
            "allocator: {} ready with a {}-byte pool",
            self.classname(),
            region.bytes
        );
        Ok(())
    }

    /// Replace the pool by a fresh one of `bytes`.
    ///
    /// Every outstanding allocation is lost.
    pub fn resize(&mut self, bytes: usize) -> AllocResult {
        self.reset();
        self.init(None, bytes)
    }

    /// Drop the heap and release the pool.
    pub fn reset(&mut self) {
        self.creation.reset_heap();
        self.reserve.reset_mem_pool();
        if self.state == HeapState::Ready {
            debug!("allocator: torn down");
        }
        self.state = HeapState::Uninitialized;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HeapState {
        self.state
    }

    /// Allocate `bytes` for the calling worker, or return what the OOM policy says.
    pub fn malloc<T: ThreadContext + ?Sized>(&self, ctx: &T, bytes: usize) -> *mut u8 {
        if self.state != HeapState::Ready {
            error!(
                "allocator: worker {} requested {} bytes before init",
                ctx.thread_id(),
                bytes
            );
            if bytes == 0 {
                return ptr::null_mut();
            }
            return self.oom.handle_oom(ctx, bytes);
        }

        let padded = A::apply_padding(bytes);
        let ptr = self
            .distribution
            .distribute(ctx, padded, A::ALIGNMENT, &self.creation);
        if C::is_oom(ptr, padded) {
            return self.oom.handle_oom(ctx, bytes);
        }
        ptr
    }

    /// [`Allocator::malloc`] for host code that prefers a `Result`.
    pub fn try_malloc<T: ThreadContext + ?Sized>(
        &self,
        ctx: &T,
        bytes: usize,
    ) -> AllocResult<NonNull<u8>> {
        if self.state != HeapState::Ready {
            return Err(AllocError::NotInitialized);
        }
        if bytes == 0 {
            return Err(AllocError::InvalidParam);
        }
        NonNull::new(self.malloc(ctx, bytes)).ok_or(AllocError::NoMemory)
    }

    /// Return memory obtained from [`Allocator::malloc`]. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an unfreed `malloc` on this allocator since its last
    /// `init`.
    pub unsafe fn free<T: ThreadContext + ?Sized>(&self, ctx: &T, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.state != HeapState::Ready {
            error!("allocator: free of {:p} before init", ptr);
            return;
        }
        unsafe { self.distribution.collect(ctx, ptr, &self.creation) };
    }

    /// Whether `ptr` returned for a `bytes` request signals exhaustion.
    pub fn is_oom(&self, ptr: *mut u8, bytes: usize) -> bool {
        C::is_oom(ptr, bytes)
    }

    /// Whether [`Allocator::available_slots`] is backed by the creation policy.
    pub fn providing_available_slots(&self) -> bool {
        C::PROVIDES_AVAILABLE_SLOTS
    }

    /// Racy count of further `slot_size` requests the heap could serve.
    ///
    /// Zero when the creation policy does not track it.
    pub fn available_slots(&self, slot_size: usize) -> usize {
        if !C::PROVIDES_AVAILABLE_SLOTS || self.state != HeapState::Ready {
            return 0;
        }
        self.creation.available_slots(A::apply_padding(slot_size))
    }

    /// Size of the reserved pool in bytes.
    pub fn pool_bytes(&self) -> usize {
        self.reserve.region().map_or(0, |region| region.bytes)
    }

    /// The creation policy, for engine-specific introspection.
    pub fn creation(&self) -> &C {
        &self.creation
    }

    /// The OOM policy, e.g. to poll [`RecordFailure`](crate::RecordFailure).
    pub fn oom(&self) -> &O {
        &self.oom
    }

    /// The reserve-pool policy holding the pool.
    pub fn reserve(&self) -> &R {
        &self.reserve
    }

    /// Names of the composed policies.
    pub fn classname(&self) -> String {
        format!(
            "{} + {} + {} + {} + {}",
            C::classname(),
            D::classname(),
            O::classname(),
            R::classname(),
            A::classname()
        )
    }
}

impl<D, O, R, A> Allocator<Scatter, D, O, R, A>
where
    D: DistributionPolicy + Default,
    O: OomPolicy + Default,
    R: ReservePoolPolicy + Default,
    A: AlignmentPolicy,
{
    /// A Scatter-based allocator with default distribution, OOM and reserve policies.
    pub fn with_config(config: ScatterConfig) -> AllocResult<Self> {
        Ok(Self::new(
            Scatter::new(config)?,
            D::default(),
            O::default(),
            R::default(),
        ))
    }
}

impl<C, D, O, R, A> Default for Allocator<C, D, O, R, A>
where
    C: CreationPolicy + Default,
    D: DistributionPolicy + Default,
    O: OomPolicy + Default,
    R: ReservePoolPolicy + Default,
    A: AlignmentPolicy,
{
    fn default() -> Self {
        Self::new(C::default(), D::default(), O::default(), R::default())
    }
}

unsafe impl<C, D, O, R, A> GlobalAlloc for Allocator<C, D, O, R, A>
where
    C: CreationPolicy,
    D: DistributionPolicy,
    O: OomPolicy,
    R: ReservePoolPolicy,
    A: AlignmentPolicy,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > A::ALIGNMENT {
            debug!(
                "allocator: alignment {} above the guaranteed {}",
                layout.align(),
                A::ALIGNMENT
            );
            return ptr::null_mut();
        }
        // Rotating ids spread host callers over the slab table like worker ids do.
        let ctx = SoloContext::new(self.ticket.fetch_add(1, Ordering::Relaxed));
        self.malloc(&ctx, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let ctx = SoloContext::new(0);
        unsafe { self.free(&ctx, ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RecordFailure, WarpCoalesce};

    type Default16 = Allocator;

    #[test]
    fn test_lifecycle() {
        let mut allocator = Default16::default();
        assert_eq!(allocator.state(), HeapState::Uninitialized);
        assert!(allocator.malloc(&SoloContext::new(0), 16).is_null());

        allocator.init(None, 0).unwrap();
        assert_eq!(allocator.state(), HeapState::Uninitialized);
        assert_eq!(allocator.pool_bytes(), 0);

        allocator.init(None, 8 * 4096).unwrap();
        assert_eq!(allocator.state(), HeapState::Ready);
        assert_eq!(allocator.pool_bytes(), 8 * 4096);
        assert_eq!(
            allocator.init(None, 4096),
            Err(AllocError::AlreadyInitialized)
        );

        let ctx = SoloContext::new(1);
        let p = allocator.malloc(&ctx, 24);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        unsafe { allocator.free(&ctx, p) };

        allocator.reset();
        assert_eq!(allocator.state(), HeapState::Uninitialized);
        assert!(allocator.malloc(&ctx, 16).is_null());
    }

    #[test]
    fn test_resize() {
        let mut allocator = Default16::default();
        allocator.init(None, 4096).unwrap();
        assert_eq!(allocator.available_slots(4096), 1);

        allocator.resize(4 * 4096).unwrap();
        assert_eq!(allocator.state(), HeapState::Ready);
        assert_eq!(allocator.available_slots(4096), 4);
    }

    #[test]
    fn test_pool_too_small_releases_pool() {
        let mut allocator = Default16::default();
        assert_eq!(allocator.init(None, 1024), Err(AllocError::PoolTooSmall));
        assert_eq!(allocator.state(), HeapState::Uninitialized);
        assert_eq!(allocator.pool_bytes(), 0);
    }

    #[test]
    fn test_try_malloc_errors() {
        let mut allocator = Default16::default();
        let ctx = SoloContext::new(0);
        assert_eq!(
            allocator.try_malloc(&ctx, 16),
            Err(AllocError::NotInitialized)
        );
        allocator.init(None, 4096).unwrap();
        assert_eq!(allocator.try_malloc(&ctx, 0), Err(AllocError::InvalidParam));
        assert_eq!(
            allocator.try_malloc(&ctx, 8192),
            Err(AllocError::NoMemory)
        );
        let p = allocator.try_malloc(&ctx, 100).unwrap();
        unsafe { allocator.free(&ctx, p.as_ptr()) };
    }

    #[test]
    fn test_record_failure_policy() {
        let mut allocator: Allocator<Scatter, Noop, RecordFailure> =
            Allocator::with_config(ScatterConfig::default()).unwrap();
        allocator.init(None, 4096).unwrap();
        let ctx = SoloContext::new(0);

        let page = allocator.malloc(&ctx, 4096);
        assert!(!page.is_null());
        assert!(!allocator.oom().failed());
        assert!(allocator.malloc(&ctx, 16).is_null());
        assert!(allocator.oom().failed());
        assert_eq!(allocator.oom().failures(), 1);
        unsafe { allocator.free(&ctx, page) };
    }

    #[test]
    fn test_classname() {
        let allocator = Default16::default();
        assert_eq!(
            allocator.classname(),
            "Scatter + Noop + ReturnNull + DeviceBuffer + Shrink<16>"
        );
        let coalescing: Allocator<Scatter, WarpCoalesce> = Allocator::default();
        assert!(coalescing.classname().contains("WarpCoalesce"));
        assert!(coalescing.providing_available_slots());
    }

    #[test]
    fn test_global_alloc_interface() {
        let mut allocator = Default16::default();
        allocator.init(None, 4 * 4096).unwrap();
        unsafe {
            let layout = Layout::from_size_align(40, 8).unwrap();
            let p = GlobalAlloc::alloc(&allocator, layout);
            assert!(!p.is_null());
            p.write_bytes(0xAB, 40);
            GlobalAlloc::dealloc(&allocator, p, layout);

            let strict = Layout::from_size_align(64, 64).unwrap();
            assert!(GlobalAlloc::alloc(&allocator, strict).is_null());
        }
    }
}
