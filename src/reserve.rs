//! Reserve-pool policies.
//!
//! The pool is one contiguous region obtained from the device runtime, or an
//! externally owned buffer adopted as is. The runtime itself is abstracted by
//! [`DeviceMemory`].

use core::alloc::Layout;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use crate::{AllocError, AllocResult, PoolRegion, ReservePoolPolicy};

/// Alignment requested for pools allocated by [`HostMemory`].
pub const POOL_ALIGN: usize = 0x1000;

/// Byte-addressed allocate/free primitive of a device runtime.
pub trait DeviceMemory {
    /// Allocate `bytes` aligned to `align`.
    fn allocate(&mut self, bytes: usize, align: usize) -> AllocResult<NonNull<u8>>;

    /// Release a region previously returned by [`DeviceMemory::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr`, `bytes` and `align` must match one earlier `allocate` call.
    unsafe fn release(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize);

    fn name() -> &'static str;
}

/// Device memory served by the global Rust allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMemory;

impl DeviceMemory for HostMemory {
    fn allocate(&mut self, bytes: usize, align: usize) -> AllocResult<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, align).map_err(|_| AllocError::InvalidParam)?;
        if layout.size() == 0 {
            return Err(AllocError::InvalidParam);
        }
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::DeviceAllocFailed)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: the caller hands back a region from `allocate` with the same layout.
        let layout = unsafe { Layout::from_size_align_unchecked(bytes, align) };
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn name() -> &'static str {
        "HostMemory"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Owned,
    Adopted,
}

/// Reserve-pool policy holding exactly one pool at a time.
pub struct DeviceBuffer<M: DeviceMemory = HostMemory> {
    memory: M,
    pool: Option<(PoolRegion, Ownership)>,
}

impl<M: DeviceMemory> DeviceBuffer<M> {
    pub const fn new(memory: M) -> Self {
        Self { memory, pool: None }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Whether the held pool will be released by this policy.
    pub fn owns_pool(&self) -> bool {
        matches!(self.pool, Some((_, Ownership::Owned)))
    }
}

impl<M: DeviceMemory + Default> Default for DeviceBuffer<M> {
    fn default() -> Self {
        Self::new(M::default())
    }
}

impl<M: DeviceMemory> ReservePoolPolicy for DeviceBuffer<M> {
    fn set_mem_pool(
        &mut self,
        existing: Option<NonNull<u8>>,
        bytes: usize,
    ) -> AllocResult<Option<PoolRegion>> {
        if bytes == 0 {
            debug!("reserve pool: zero-byte pool requested, nothing reserved");
            return Ok(None);
        }
        if self.pool.is_some() {
            warn!("reserve pool: pool already set, reset it first");
            return Err(AllocError::AlreadyInitialized);
        }

        let (base, ownership) = match existing {
            Some(ptr) => (ptr, Ownership::Adopted),
            None => {
                let ptr = self.memory.allocate(bytes, POOL_ALIGN).map_err(|e| {
                    error!(
                        "reserve pool: {} failed to provide {} bytes: {}",
                        M::name(),
                        bytes,
                        e
                    );
                    match e {
                        AllocError::InvalidParam => AllocError::InvalidParam,
                        _ => AllocError::DeviceAllocFailed,
                    }
                })?;
                (ptr, Ownership::Owned)
            }
        };

        let region = PoolRegion::new(base, bytes);
        info!(
            "reserve pool: {:?} pool [{:#x}, {:#x}) from {}",
            ownership,
            base.as_ptr() as usize,
            region.end(),
            M::name()
        );
        self.pool = Some((region, ownership));
        Ok(Some(region))
    }

    fn reset_mem_pool(&mut self) {
        if let Some((region, ownership)) = self.pool.take() {
            if ownership == Ownership::Owned {
                // SAFETY: owned regions were allocated with this size and POOL_ALIGN.
                unsafe { self.memory.release(region.base, region.bytes, POOL_ALIGN) };
            }
            debug!(
                "reserve pool: released {:?} pool at {:#x}",
                ownership,
                region.base.as_ptr() as usize
            );
        }
    }

    fn region(&self) -> Option<PoolRegion> {
        self.pool.map(|(region, _)| region)
    }

    fn classname() -> &'static str {
        "DeviceBuffer"
    }
}

impl<M: DeviceMemory> Drop for DeviceBuffer<M> {
    fn drop(&mut self) {
        self.reset_mem_pool();
    }
}
