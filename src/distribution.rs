//! Distribution policies.
//!
//! They sit between the facade and the creation policy and decide which lane of a
//! cooperating group actually calls `create`.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::warn;

use crate::{CreationPolicy, DistributionPolicy, ThreadContext};

/// Every lane allocates for itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl DistributionPolicy for Noop {
    fn distribute<T, C>(&self, ctx: &T, bytes: usize, _align: usize, creation: &C) -> *mut u8
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy,
    {
        creation.create(ctx, bytes)
    }

    unsafe fn collect<T, C>(&self, ctx: &T, ptr: *mut u8, creation: &C)
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy,
    {
        unsafe { creation.destroy(ctx, ptr) }
    }

    fn classname() -> &'static str {
        "Noop"
    }
}

/// One lane allocates a shared block for the whole group.
///
/// Lanes agree on their offsets with an exclusive prefix sum, lane 0 creates a block
/// big enough for every request plus a header, and the block travels to the other
/// lanes by broadcast. The header counts the lanes still holding a piece of the
/// block; the last lane to free it returns the block to the creation policy.
///
/// Every lane of the group has to call `malloc` together, lanes without a request
/// pass zero bytes. When the combined size exceeds what the creation policy can
/// serve, or overflows, each lane falls back to its own block with a header of one.
/// A lane whose own request is too large for that gets null.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarpCoalesce;

const LEADER: usize = 0;

impl WarpCoalesce {
    /// Header in front of the first lane's bytes, keeping lane pointers aligned.
    pub const fn header_bytes(align: usize) -> usize {
        if align > size_of::<AtomicUsize>() {
            align
        } else {
            size_of::<AtomicUsize>()
        }
    }

    /// # Safety
    ///
    /// `block` must be a fresh slot of at least `size_of::<AtomicUsize>()` bytes,
    /// aligned for `AtomicUsize`.
    unsafe fn init_header(block: *mut u8, lanes: usize) {
        unsafe { ptr::write(block as *mut AtomicUsize, AtomicUsize::new(lanes)) };
    }

    fn solo_block<T, C>(ctx: &T, bytes: usize, header: usize, creation: &C) -> *mut u8
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy,
    {
        match header.checked_add(bytes) {
            Some(total) if total <= creation.max_request() => {
                let block = creation.create(ctx, total);
                if block.is_null() {
                    return block;
                }
                unsafe {
                    Self::init_header(block, 1);
                    block.add(header)
                }
            }
            _ => ptr::null_mut(),
        }
    }
}

impl DistributionPolicy for WarpCoalesce {
    fn distribute<T, C>(&self, ctx: &T, bytes: usize, align: usize, creation: &C) -> *mut u8
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy,
    {
        let header = Self::header_bytes(align);
        let wants = bytes != 0;
        let (offset, total) = ctx.exclusive_sum(bytes);
        let (_, lanes) = ctx.exclusive_sum(usize::from(wants));
        if total == 0 {
            return ptr::null_mut();
        }

        // A saturated total means the group asked for more than `usize` can hold.
        let shared = header
            .checked_add(total)
            .filter(|&block_bytes| {
                total != usize::MAX && block_bytes <= creation.max_request()
            });
        let Some(block_bytes) = shared else {
            // The decision depends only on group-wide values, so all lanes land here.
            if !wants {
                return ptr::null_mut();
            }
            return Self::solo_block(ctx, bytes, header, creation);
        };

        let mut block = ptr::null_mut::<u8>();
        if ctx.lane() == LEADER {
            block = creation.create(ctx, block_bytes);
            if !block.is_null() {
                unsafe { Self::init_header(block, lanes) };
            }
        }
        let block = ctx.broadcast(block as usize, LEADER) as *mut u8;
        if !wants || block.is_null() {
            return ptr::null_mut();
        }
        unsafe { block.add(header + offset) }
    }

    unsafe fn collect<T, C>(&self, ctx: &T, ptr: *mut u8, creation: &C)
    where
        T: ThreadContext + ?Sized,
        C: CreationPolicy,
    {
        let block = creation.slot_base(ptr);
        if block.is_null() {
            warn!("warp coalesce: {:p} is not inside the heap", ptr);
            return;
        }
        // SAFETY: every block handed out starts with an initialized header.
        let live = unsafe { &*(block as *const AtomicUsize) };
        if live.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe { creation.destroy(ctx, block) };
        }
    }

    fn classname() -> &'static str {
        "WarpCoalesce"
    }
}
