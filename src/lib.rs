//! Device slab allocator
//!
//! A lock-free dynamic memory allocator for workloads where thousands of workers
//! request small, short-lived blocks at the same time, featuring:
//! - Reserve-pool policy obtaining one contiguous pool from a device runtime
//! - Scatter creation engine splitting the pool into slabs of doubling slot sizes
//! - Distribution policies coalescing requests of cooperating lanes
//! - Out-of-memory and alignment policies
//! - An [`Allocator`] facade composing all of the above

#![no_std]

extern crate alloc;

use core::fmt;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// The error type used by the host-side lifecycle of the allocator.
///
/// Device-side paths (`create`, `destroy`, `malloc`, `free`) never return it;
/// they signal failure with null pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid size, alignment or configuration.
    InvalidParam,
    /// No enough memory to allocate.
    NoMemory,
    /// The pool cannot hold a single slab.
    PoolTooSmall,
    /// The device runtime refused to hand out the pool.
    DeviceAllocFailed,
    /// A pool or heap is already set up.
    AlreadyInitialized,
    /// The operation needs an initialized heap.
    NotInitialized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidParam => "invalid parameter",
            AllocError::NoMemory => "out of memory",
            AllocError::PoolTooSmall => "pool too small for one slab",
            AllocError::DeviceAllocFailed => "device memory allocation failed",
            AllocError::AlreadyInitialized => "heap already initialized",
            AllocError::NotInitialized => "heap not initialized",
        };
        f.write_str(msg)
    }
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// A contiguous byte range handed out by a reserve-pool policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRegion {
    /// First byte of the region.
    pub base: NonNull<u8>,
    /// Length of the region in bytes.
    pub bytes: usize,
}

// SAFETY: a region only describes an address range; every access to the bytes
// goes through the creation policy's slot ownership.
unsafe impl Send for PoolRegion {}
unsafe impl Sync for PoolRegion {}

impl PoolRegion {
    /// Describes `bytes` bytes starting at `base`.
    pub const fn new(base: NonNull<u8>, bytes: usize) -> Self {
        Self { base, bytes }
    }

    /// First address past the region.
    pub fn end(&self) -> usize {
        self.base.as_ptr() as usize + self.bytes
    }
}

/// Obtains and releases the raw backing memory of one allocator.
pub trait ReservePoolPolicy {
    /// Reserve `bytes` of pool memory, or adopt `existing` when given.
    ///
    /// A zero-byte request is a no-op and yields `Ok(None)`.
    fn set_mem_pool(
        &mut self,
        existing: Option<NonNull<u8>>,
        bytes: usize,
    ) -> AllocResult<Option<PoolRegion>>;

    /// Release the pool if this policy owns it.
    fn reset_mem_pool(&mut self);

    /// The region currently held, if any.
    fn region(&self) -> Option<PoolRegion>;

    /// Name of the policy, as listed by [`Allocator::classname`].
    fn classname() -> &'static str;
}

/// The core slot-claiming engine.
///
/// `create` and `destroy` are called concurrently by any number of workers and
/// must stay lock-free. `init_heap` and `reset_heap` are exclusive.
pub trait CreationPolicy {
    /// Whether [`CreationPolicy::available_slots`] returns meaningful numbers.
    const PROVIDES_AVAILABLE_SLOTS: bool;

    /// Lay the slab table over `[base, base + bytes)`. Zero bytes is a no-op.
    fn init_heap(&mut self, base: NonNull<u8>, bytes: usize) -> AllocResult;

    /// Forget the pool. Outstanding pointers become dangling.
    fn reset_heap(&mut self);

    /// Whether a heap is laid over a pool.
    fn is_initialized(&self) -> bool;

    /// Claim a slot of at least `bytes`, or return null.
    fn create<T: ThreadContext + ?Sized>(&self, ctx: &T, bytes: usize) -> *mut u8;

    /// Return the slot containing `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from an unfreed `create` on this instance.
    unsafe fn destroy<T: ThreadContext + ?Sized>(&self, ctx: &T, ptr: *mut u8);

    /// Whether `create` returning `ptr` for `bytes` means the heap ran dry.
    fn is_oom(ptr: *mut u8, bytes: usize) -> bool {
        ptr.is_null() && bytes != 0
    }

    /// A racy, conservative count of slots of `slot_size` that could still be handed out.
    fn available_slots(&self, slot_size: usize) -> usize;

    /// Start of the slot containing `ptr`, or null if `ptr` is not in the heap.
    fn slot_base(&self, ptr: *mut u8) -> *mut u8;

    /// Largest request `create` can satisfy.
    fn max_request(&self) -> usize;

    /// Name of the policy, as listed by [`Allocator::classname`].
    fn classname() -> &'static str;
}

/// Spreads one logical request of a worker group over the creation policy.
pub trait DistributionPolicy {
    /// Allocate `bytes` (already padded to `align`) for the calling lane.
    fn distribute<T, C>(&self, ctx: &T, bytes: usize, align: usize, creation: &C) -> *mut u8
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy;

    /// Free path matching [`DistributionPolicy::distribute`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from an unfreed `distribute` of this policy over `creation`.
    unsafe fn collect<T, C>(&self, ctx: &T, ptr: *mut u8, creation: &C)
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy;

    /// Name of the policy, as listed by [`Allocator::classname`].
    fn classname() -> &'static str;
}

/// Decides what `malloc` hands back once the creation policy came up empty.
pub trait OomPolicy {
    /// Value `malloc` returns for the failed `bytes` request of `ctx`.
    ///
    /// Must not allocate.
    fn handle_oom<T: ThreadContext + ?Sized>(&self, ctx: &T, bytes: usize) -> *mut u8;

    /// Name of the policy, as listed by [`Allocator::classname`].
    fn classname() -> &'static str;
}

/// Rounds request sizes and the pool to a fixed alignment.
pub trait AlignmentPolicy {
    /// Alignment of every pointer handed out and of the pool start.
    const ALIGNMENT: usize;

    /// Round `bytes` up to a multiple of [`AlignmentPolicy::ALIGNMENT`].
    fn apply_padding(bytes: usize) -> usize;

    /// Move the pool start up to the alignment, shrinking it accordingly.
    fn align_pool(region: PoolRegion) -> Option<PoolRegion>;

    /// Name of the policy, as listed by [`Allocator::classname`].
    fn classname() -> &'static str;
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod context;
pub use context::{GroupLane, LockstepGroup, SoloContext, ThreadContext};

pub mod alignment;
pub use alignment::{NoAlign, Shrink};

pub mod oom;
pub use oom::{Abort, RecordFailure, ReturnNull};

pub mod reserve;
pub use reserve::{DeviceBuffer, DeviceMemory, HostMemory};

pub mod scatter;
#[cfg(feature = "tracking")]
pub use scatter::HeapStats;
pub use scatter::{BoundedProbe, Reclaim, Scatter, ScatterConfig, SizeClasses};

pub mod distribution;
pub use distribution::{Noop, WarpCoalesce};

pub mod allocator;
pub use allocator::{Allocator, HeapState};
