//! Rotating history buffers
//!
//! The BDF stencil and the extrapolation both consume the last `q` solution
//! snapshots. Snapshots may be large distributed vectors, so rotation must
//! be O(1) in the size of the stored state: the buffer keeps an arena of
//! slots and a rotating start index, and `rotate` swaps the incoming value
//! into the slot being evicted. No deep copies, no per-step allocation.
//!
//! The same buffer type backs the solution history and the cache of
//! explicitly evaluated convective terms; the step controller rotates both
//! in lockstep so they can never desynchronize.

use crate::error::{Result, TimeIntError};

/// Fixed-capacity rotating store of the last `depth` snapshots
///
/// Slot 0 always holds the most recently completed step's value; slot
/// `depth - 1` is the oldest retained snapshot and is the one evicted on the
/// next rotation.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    slots: Vec<T>,
    start: usize,
}

impl<T> HistoryBuffer<T> {
    /// Allocate a buffer of `depth` slots, each produced by `init(offset)`
    /// for offset 0 (most recent) .. depth-1 (oldest). Sizing happens once;
    /// the buffer is never resized afterwards.
    pub fn new_with(depth: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..depth).map(&mut init).collect(),
            start: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Most recently completed step's snapshot (the buffer always holds at
    /// least one slot)
    pub fn current(&self) -> &T {
        &self.slots[self.start]
    }

    /// Snapshot `i` steps back (0-based)
    pub fn get(&self, i: usize) -> Result<&T> {
        if i >= self.slots.len() {
            return Err(TimeIntError::OutOfRange {
                index: i,
                depth: self.slots.len(),
            });
        }
        Ok(&self.slots[self.index_of(i)])
    }

    /// Mutable access to snapshot `i` steps back (used for in-place seeding)
    pub fn get_mut(&mut self, i: usize) -> Result<&mut T> {
        if i >= self.slots.len() {
            return Err(TimeIntError::OutOfRange {
                index: i,
                depth: self.slots.len(),
            });
        }
        let idx = self.index_of(i);
        Ok(&mut self.slots[idx])
    }

    /// Shift every slot one position back and install `new_current` as slot 0.
    ///
    /// Returns the evicted oldest snapshot so the caller can reuse its
    /// allocation for the next step. O(1): an index advance plus one swap.
    pub fn rotate(&mut self, new_current: T) -> T {
        let depth = self.slots.len();
        self.start = (self.start + depth - 1) % depth;
        std::mem::replace(&mut self.slots[self.start], new_current)
    }

    /// Seed every slot at startup or restart: `values[i]` becomes the
    /// snapshot `i` steps back.
    pub fn initialize_all(&mut self, values: Vec<T>) -> Result<()> {
        if values.len() != self.slots.len() {
            return Err(TimeIntError::OutOfRange {
                index: values.len(),
                depth: self.slots.len(),
            });
        }
        self.start = 0;
        for (slot, value) in self.slots.iter_mut().zip(values) {
            *slot = value;
        }
        Ok(())
    }

    /// Snapshots in logical order (most recent first), e.g. for restart
    /// serialization.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &T> {
        (0..self.slots.len()).map(move |i| &self.slots[self.index_of(i)])
    }

    fn index_of(&self, i: usize) -> usize {
        (self.start + i) % self.slots.len()
    }
}

impl<T: Clone> HistoryBuffer<T> {
    /// Logical-order copy of the stored snapshots
    pub fn to_ordered_vec(&self) -> Vec<T> {
        self.iter_ordered().cloned().collect()
    }
}
