//! Alignment policies.

use crate::{align_up, is_aligned, AlignmentPolicy, PoolRegion};
use core::ptr::NonNull;

/// Pads every request and the pool start to `ALIGN` bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shrink<const ALIGN: usize = 16>;

impl<const ALIGN: usize> Shrink<ALIGN> {
    const VALID: () = assert!(
        ALIGN.is_power_of_two(),
        "Shrink alignment must be a power of two"
    );
}

impl<const ALIGN: usize> AlignmentPolicy for Shrink<ALIGN> {
    const ALIGNMENT: usize = ALIGN;

    fn apply_padding(bytes: usize) -> usize {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        match bytes.checked_add(ALIGN - 1) {
            Some(padded) => padded & !(ALIGN - 1),
            // Saturate at the largest multiple; no heap can serve it anyway.
            None => usize::MAX & !(ALIGN - 1),
        }
    }

    fn align_pool(region: PoolRegion) -> Option<PoolRegion> {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        let start = region.base.as_ptr() as usize;
        if is_aligned(start, ALIGN) {
            return Some(region);
        }
        let aligned = align_up(start, ALIGN);
        let shift = aligned - start;
        if shift >= region.bytes {
            return None;
        }
        let base = NonNull::new(aligned as *mut u8)?;
        Some(PoolRegion::new(base, region.bytes - shift))
    }

    fn classname() -> &'static str {
        match ALIGN {
            1 => "Shrink<1>",
            2 => "Shrink<2>",
            4 => "Shrink<4>",
            8 => "Shrink<8>",
            16 => "Shrink<16>",
            32 => "Shrink<32>",
            64 => "Shrink<64>",
            128 => "Shrink<128>",
            256 => "Shrink<256>",
            _ => "Shrink",
        }
    }
}

/// Leaves sizes and the pool untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAlign;

impl AlignmentPolicy for NoAlign {
    const ALIGNMENT: usize = 1;

    fn apply_padding(bytes: usize) -> usize {
        bytes
    }

    fn align_pool(region: PoolRegion) -> Option<PoolRegion> {
        Some(region)
    }

    fn classname() -> &'static str {
        "NoAlign"
    }
}
