//! The generic arena-backed B-tree shared by the counter array and the bitset.

use arrayvec::ArrayVec;

/// Handle to a tree node: a word offset into the arena.
pub type NodeRef = u32;

/// Marker for an interior slot that covers no elements.
const EMPTY_CHILD: u32 = u32::MAX;

const INIT_WORDS: usize = 1 << 20;
const GROWTH_FACTOR: usize = 4;

/// Upper bound on tree height plus one; with a branching factor of 4 and at
/// least 32 slots per leaf, 16 levels cover any array addressable by `u32`.
pub(crate) const MAX_DEPTH: usize = 16;

pub(crate) type Path = ArrayVec<NodeRef, MAX_DEPTH>;

/// `BP` is the branching factor as a power of two, `S` the slot width as a
/// power of two (in bits). Both are fixed at compile time so index
/// arithmetic folds to shifts and masks.
pub(crate) struct Store<const BP: u32, const S: u32> {
    mem: Vec<u32>,
    top: usize,
    len: usize,
    height: usize,
    version: u32,
}

impl<const BP: u32, const S: u32> Store<BP, S> {
    pub(crate) const B: usize = 1 << BP;
    /// log2 of the number of slots in one `u32` word.
    const CELL_P: u32 = 5 - S;
    /// log2 of the number of slots in one leaf node.
    const NODE_P: u32 = Self::CELL_P + BP;
    pub(crate) const SLOT_MASK: u32 = (1u32 << (1 << S)) - 1;

    pub(crate) fn new() -> Self {
        Store {
            mem: Vec::new(),
            top: 0,
            len: 0,
            height: 0,
            version: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn new_version(&mut self) {
        self.version += 1;
    }

    /// Which child of a node at height `h` the element `i` lives under.
    #[inline]
    fn chid(h: usize, i: usize) -> usize {
        (i >> (h as u32 * BP + Self::CELL_P)) & (Self::B - 1)
    }

    /// Bit offset of element `i` inside its word.
    #[inline]
    pub(crate) fn shift(i: usize) -> u32 {
        ((i as u32) & ((1 << Self::CELL_P) - 1)) << S
    }

    #[inline]
    fn stamp(&self, node: NodeRef) -> u32 {
        self.mem[node as usize]
    }

    #[inline]
    fn child(&self, node: NodeRef, j: usize) -> u32 {
        self.mem[node as usize + 1 + j]
    }

    #[inline]
    fn set_child(&mut self, node: NodeRef, j: usize, v: u32) {
        self.mem[node as usize + 1 + j] = v;
    }

    fn grow(&mut self) {
        let target = (self.mem.len() * GROWTH_FACTOR).max(INIT_WORDS);
        self.mem.resize(target, 0);
    }

    fn alloc(&mut self) -> NodeRef {
        if self.top + 1 + Self::B > self.mem.len() {
            self.grow();
        }
        let r = self.top;
        self.top += 1 + Self::B;
        self.mem[r] = self.version;
        for j in 0..Self::B {
            self.mem[r + 1 + j] = 0;
        }
        r as NodeRef
    }

    fn alloc_copy(&mut self, src: NodeRef) -> NodeRef {
        if self.top + 1 + Self::B > self.mem.len() {
            self.grow();
        }
        let r = self.top;
        self.top += 1 + Self::B;
        self.mem[r] = self.version;
        let s = src as usize;
        self.mem.copy_within(s + 1..s + 1 + Self::B, r + 1);
        r as NodeRef
    }

    /// Rebuild the tree from scratch over `data`, discarding every previous
    /// version, and return the root of version 0.
    pub(crate) fn init(&mut self, data: &[u32]) -> NodeRef {
        if self.mem.len() < INIT_WORDS {
            self.mem.resize(INIT_WORDS, 0);
        }
        self.top = 0;
        self.version = 0;
        self.len = data.len();
        self.height = 0;
        let mut cap = 1usize << Self::NODE_P;
        while cap < data.len() {
            cap <<= BP;
            self.height += 1;
        }
        self.build(0, self.height, data)
    }

    fn build(&mut self, l: usize, h: usize, data: &[u32]) -> NodeRef {
        let cur = self.alloc();
        if h == 0 {
            for i in 0..1usize << Self::NODE_P {
                if l + i >= data.len() {
                    break;
                }
                let w = cur as usize + 1 + Self::chid(0, l + i);
                self.mem[w] |= (data[l + i] & Self::SLOT_MASK) << Self::shift(l + i);
            }
        } else {
            for j in 0..Self::B {
                let cl = l + (j << (h as u32 * BP + Self::CELL_P));
                let sub = if cl >= data.len() {
                    EMPTY_CHILD
                } else {
                    self.build(cl, h - 1, data)
                };
                self.set_child(cur, j, sub);
            }
        }
        cur
    }

    /// Leaf word holding element `i`, for read-only access.
    pub(crate) fn leaf_word(&self, root: NodeRef, i: usize) -> u32 {
        debug_assert!(i < self.len);
        let mut cur = root;
        for h in 0..self.height {
            cur = self.child(cur, Self::chid(self.height - h, i));
        }
        self.child(cur, Self::chid(0, i))
    }

    /// Root-to-leaf path for element `i`, for a subsequent [`Self::rewrite`].
    pub(crate) fn path(&self, root: NodeRef, i: usize) -> (Path, u32) {
        debug_assert!(i < self.len);
        let mut stack = Path::new();
        stack.push(root);
        for h in 0..self.height {
            let next = self.child(stack[h], Self::chid(self.height - h, i));
            stack.push(next);
        }
        let leaf = stack[self.height];
        (stack, self.child(leaf, Self::chid(0, i)))
    }

    /// Replace the leaf word of element `i` with `word`, copying stale nodes
    /// on the way back up. Returns the (possibly unchanged) new root.
    pub(crate) fn rewrite(&mut self, stack: &mut Path, i: usize, word: u32) -> NodeRef {
        let last = stack.len() - 1;
        let leaf = stack[last];
        let wi = Self::chid(0, i);
        if self.stamp(leaf) == self.version {
            self.set_child(leaf, wi, word);
            return stack[0];
        }
        let fresh = self.alloc_copy(leaf);
        self.set_child(fresh, wi, word);
        stack[last] = fresh;
        for h in (0..last).rev() {
            let ci = Self::chid(self.height - h, i);
            if self.child(stack[h], ci) == stack[h + 1] {
                break;
            }
            if self.stamp(stack[h]) == self.version {
                self.set_child(stack[h], ci, stack[h + 1]);
            } else {
                let p = self.alloc_copy(stack[h]);
                self.set_child(p, ci, stack[h + 1]);
                stack[h] = p;
            }
        }
        stack[0]
    }
}
