//! Bounded slab probing.

/// Visits at most `limit` distinct indices of `0..modulus`, starting at `start` and
/// wrapping around.
///
/// The engine never loops on a slab index; once the probe is spent `create`
/// reports failure.
#[derive(Debug, Clone)]
pub struct BoundedProbe {
    next: usize,
    modulus: usize,
    remaining: usize,
}

impl BoundedProbe {
    pub fn new(start: usize, modulus: usize, limit: usize) -> Self {
        if modulus == 0 {
            return Self {
                next: 0,
                modulus: 0,
                remaining: 0,
            };
        }
        Self {
            next: start % modulus,
            modulus,
            remaining: limit.min(modulus),
        }
    }
}

impl Iterator for BoundedProbe {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let index = self.next;
        self.next = if index + 1 == self.modulus { 0 } else { index + 1 };
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BoundedProbe {}
