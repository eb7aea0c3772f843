//! Slab descriptor table.
//!
//! One packed state word per slab holds its size class and the number of reserved
//! slots, so that assigning a class and reserving a slot is a single CAS. Slot
//! occupancy lives in a flat arena of `u64` words, `words_per_slab` words per slab,
//! one bit per slot (set = occupied).
//!
//! A claim first reserves a fill count, then sets a bit; a free clears the bit, then
//! drops the fill count. Set bits therefore never outnumber the fill count, and a
//! slab whose fill count reaches zero has an all-clear bitmap row.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::config::Reclaim;

/// Class field of a slab that serves no size class yet.
pub const UNASSIGNED: u32 = u32::MAX;

/// Lost races tolerated on top of the slab capacity before a claim gives up.
const CONTENTION_SLACK: usize = 64;

const BITS_PER_WORD: usize = u64::BITS as usize;

#[inline]
const fn pack(class: u32, fill: u32) -> u64 {
    ((class as u64) << 32) | fill as u64
}

#[inline]
const fn class_of(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
const fn fill_of(state: u64) -> u32 {
    state as u32
}

/// Valid slot bits of bitmap word `word` for a slab of `capacity` slots.
#[inline]
const fn word_mask(capacity: usize, word: usize) -> u64 {
    let first = word * BITS_PER_WORD;
    if first + BITS_PER_WORD <= capacity {
        u64::MAX
    } else {
        (1u64 << (capacity - first)) - 1
    }
}

#[inline]
const fn contention_budget(capacity: usize) -> usize {
    2 * capacity + CONTENTION_SLACK
}

/// Outcome of [`SlabTable::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A slot is reserved; `assigned` is set when this call gave the slab its class.
    Granted { assigned: bool },
    /// The slab serves another class or is full.
    Refused,
    /// Too many lost races; try elsewhere.
    Contended,
}

pub struct SlabTable {
    states: Box<[AtomicU64]>,
    bitmap: Box<[AtomicU64]>,
    words_per_slab: usize,
}

impl SlabTable {
    /// A table of `slab_count` unassigned slabs of up to `max_slots` slots each.
    pub fn new(slab_count: usize, max_slots: usize) -> Self {
        let words_per_slab = max_slots.div_ceil(BITS_PER_WORD);
        let states: Vec<AtomicU64> = (0..slab_count)
            .map(|_| AtomicU64::new(pack(UNASSIGNED, 0)))
            .collect();
        let bitmap: Vec<AtomicU64> = (0..slab_count * words_per_slab)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            states: states.into_boxed_slice(),
            bitmap: bitmap.into_boxed_slice(),
            words_per_slab,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Size class served by `slab`, `None` while unassigned.
    pub fn class_of(&self, slab: usize) -> Option<usize> {
        let class = class_of(self.states[slab].load(Ordering::Acquire));
        (class != UNASSIGNED).then_some(class as usize)
    }

    /// Number of reserved slots in `slab`.
    pub fn fill(&self, slab: usize) -> usize {
        fill_of(self.states[slab].load(Ordering::Acquire)) as usize
    }

    /// Class and fill count of `slab` read together.
    pub fn snapshot(&self, slab: usize) -> (Option<usize>, usize) {
        let state = self.states[slab].load(Ordering::Acquire);
        let class = class_of(state);
        (
            (class != UNASSIGNED).then_some(class as usize),
            fill_of(state) as usize,
        )
    }

    /// Reserve one slot of `class` in `slab`, assigning an unassigned slab first.
    pub fn reserve(&self, slab: usize, class: usize, capacity: usize) -> Reservation {
        let state = &self.states[slab];
        let class = class as u32;
        let mut current = state.load(Ordering::Acquire);
        for _ in 0..contention_budget(capacity) {
            let (next, assigned) = match class_of(current) {
                c if c == class => {
                    let fill = fill_of(current);
                    if fill as usize >= capacity {
                        return Reservation::Refused;
                    }
                    (pack(class, fill + 1), false)
                }
                UNASSIGNED => (pack(class, 1), true),
                _ => return Reservation::Refused,
            };
            match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Reservation::Granted { assigned },
                Err(actual) => current = actual,
            }
        }
        Reservation::Contended
    }

    /// Set one clear bit among the first `capacity` bits of `slab`'s row.
    ///
    /// The scan starts at word `hint % words` to keep workers apart and cycles
    /// through the row. The caller must hold a reservation, which guarantees a clear
    /// bit exists. Every full word passed and every race lost spends one unit of the
    /// contention budget; `None` means the budget ran out.
    pub fn claim_bit(&self, slab: usize, capacity: usize, hint: usize) -> Option<usize> {
        let words = capacity.div_ceil(BITS_PER_WORD);
        let row = self.row(slab);
        let mut w = hint % words;

        for _ in 0..contention_budget(capacity) {
            let free = !row[w].load(Ordering::Relaxed) & word_mask(capacity, w);
            if free == 0 {
                w = if w + 1 == words { 0 } else { w + 1 };
                continue;
            }
            let mask = 1u64 << free.trailing_zeros();
            if row[w].fetch_or(mask, Ordering::Acquire) & mask == 0 {
                return Some(w * BITS_PER_WORD + mask.trailing_zeros() as usize);
            }
            // Lost the bit; the same word may still hold another one.
        }
        None
    }

    /// Clear the bit of `slot`. Returns `false` if it was already clear.
    pub fn clear_bit(&self, slab: usize, slot: usize) -> bool {
        let word = &self.row(slab)[slot / BITS_PER_WORD];
        let mask = 1u64 << (slot % BITS_PER_WORD);
        word.fetch_and(!mask, Ordering::Release) & mask != 0
    }

    pub fn is_occupied(&self, slab: usize, slot: usize) -> bool {
        let word = &self.row(slab)[slot / BITS_PER_WORD];
        word.load(Ordering::Acquire) & (1u64 << (slot % BITS_PER_WORD)) != 0
    }

    /// Drop one reservation of `slab`. Returns `true` if the slab became unassigned.
    ///
    /// Not bounded like the claim path: every lost CAS means another worker made
    /// progress, and a free must not be abandoned.
    pub fn release(&self, slab: usize, reclaim: Reclaim) -> bool {
        let state = &self.states[slab];
        let mut current = state.load(Ordering::Acquire);
        loop {
            let fill = fill_of(current);
            debug_assert!(fill > 0, "release on slab {} without reservation", slab);
            if fill == 0 {
                return false;
            }
            let next = if fill == 1 && reclaim == Reclaim::Release {
                pack(UNASSIGNED, 0)
            } else {
                pack(class_of(current), fill - 1)
            };
            match state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return class_of(next) == UNASSIGNED,
                Err(actual) => current = actual,
            }
        }
    }

    fn row(&self, slab: usize) -> &[AtomicU64] {
        let start = slab * self.words_per_slab;
        &self.bitmap[start..start + self.words_per_slab]
    }
}
