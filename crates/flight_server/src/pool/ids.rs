//! Worker id allocation with reuse.
//!
//! Pool threads are named after a small integer id. Ids are handed out as the
//! smallest positive integer not currently in use, so a pool that has been
//! growing and shrinking for weeks still reports `logic-1..logic-N` rather
//! than ever-increasing numbers.

use std::collections::BTreeSet;

/// Returns the smallest positive integer not contained in `in_use`.
pub fn smallest_free_id(in_use: &BTreeSet<usize>) -> usize {
    let mut candidate = 1;
    for &id in in_use.range(1..) {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Tracks which worker ids are currently taken.
#[derive(Debug, Default)]
pub struct IdAllocator {
    in_use: BTreeSet<usize>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the smallest free id.
    pub fn acquire(&mut self) -> usize {
        let id = smallest_free_id(&self.in_use);
        self.in_use.insert(id);
        id
    }

    /// Returns an id to the free set. Returns `false` if it was not taken.
    pub fn release(&mut self, id: usize) -> bool {
        self.in_use.remove(&id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.in_use.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
