//! A persistent array of 2-bit saturating down-counters.

use crate::store::{NodeRef, Store};

/// Fixed-size array of counters in `0..=3` supporting persistent decrement.
///
/// The only mutation is [`dec`](Self::dec), which is all the in-degree
/// bookkeeping of a saturation pass needs: counters are initialised to the
/// number of outstanding children and ticked down as children resolve.
pub struct PersistentCounters {
    store: Store<2, 1>,
}

impl PersistentCounters {
    pub fn new() -> Self {
        PersistentCounters {
            store: Store::new(),
        }
    }

    /// Build version 0 over `values`, saturating each entry at the 2-bit
    /// maximum. Any previously issued root becomes invalid.
    pub fn init(&mut self, values: &[u32]) -> NodeRef {
        let clamped: Vec<u32> = values
            .iter()
            .map(|&v| v.min(Store::<2, 1>::SLOT_MASK))
            .collect();
        self.store.init(&clamped)
    }

    /// Seal every node allocated so far; subsequent decrements copy them
    /// instead of mutating in place.
    pub fn new_version(&mut self) {
        self.store.new_version();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Decrement entry `i`, returning the new root and the value the entry
    /// held *before* the decrement. An entry already at 0 stays at 0 and the
    /// root is returned unchanged.
    pub fn dec(&mut self, root: NodeRef, i: usize) -> (NodeRef, u32) {
        let (mut stack, word) = self.store.path(root, i);
        let sh = Store::<2, 1>::shift(i);
        let val = (word >> sh) & Store::<2, 1>::SLOT_MASK;
        if val == 0 {
            return (root, 0);
        }
        // (val ^ (val - 1)) is exactly the bits that flip when subtracting 1
        // within the 2-bit field.
        let next = word ^ ((val ^ (val - 1)) << sh);
        (self.store.rewrite(&mut stack, i, next), val)
    }
}

impl Default for PersistentCounters {
    fn default() -> Self {
        Self::new()
    }
}
