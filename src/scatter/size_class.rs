//! Doubling slot size classes.

/// The classes `smallest << 0 ..= largest`, each twice the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    smallest_shift: u32,
    count: usize,
}

impl SizeClasses {
    /// Both bounds must be powers of two with `smallest <= largest`.
    pub const fn new(smallest: usize, largest: usize) -> Self {
        let smallest_shift = smallest.trailing_zeros();
        let count = (largest.trailing_zeros() - smallest_shift) as usize + 1;
        Self {
            smallest_shift,
            count,
        }
    }

    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn smallest(&self) -> usize {
        1 << self.smallest_shift
    }

    pub const fn largest(&self) -> usize {
        self.size(self.count - 1)
    }

    /// Slot size of class `index`.
    pub const fn size(&self, index: usize) -> usize {
        1 << (self.smallest_shift as usize + index)
    }

    /// Smallest class holding `bytes`, or `None` for zero or oversized requests.
    pub fn for_request(&self, bytes: usize) -> Option<usize> {
        if bytes == 0 || bytes > self.largest() {
            return None;
        }
        if bytes <= self.smallest() {
            return Some(0);
        }
        let shift = bytes.next_power_of_two().trailing_zeros();
        Some((shift - self.smallest_shift) as usize)
    }
}
