//! A persistent bitset.

use crate::store::{NodeRef, Store};

/// Fixed-size set of bits supporting persistent one-way `set`.
pub struct PersistentBitSet {
    store: Store<2, 0>,
}

impl PersistentBitSet {
    pub fn new() -> Self {
        PersistentBitSet {
            store: Store::new(),
        }
    }

    /// Build version 0 with `size` cleared bits. Any previously issued root
    /// becomes invalid.
    pub fn init(&mut self, size: usize) -> NodeRef {
        self.store.init(&vec![0; size])
    }

    /// Seal every node allocated so far; subsequent sets copy them instead of
    /// mutating in place.
    pub fn new_version(&mut self) {
        self.store.new_version();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    pub fn get(&self, root: NodeRef, i: usize) -> bool {
        (self.store.leaf_word(root, i) >> Store::<2, 0>::shift(i)) & 1 != 0
    }

    /// Set bit `i`, returning the new root and whether the bit was already
    /// set (in which case the root is returned unchanged).
    pub fn set(&mut self, root: NodeRef, i: usize) -> (NodeRef, bool) {
        let (mut stack, word) = self.store.path(root, i);
        let mask = 1u32 << Store::<2, 0>::shift(i);
        if word & mask != 0 {
            return (root, true);
        }
        (self.store.rewrite(&mut stack, i, word | mask), false)
    }
}

impl Default for PersistentBitSet {
    fn default() -> Self {
        Self::new()
    }
}
