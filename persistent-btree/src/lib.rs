//! Persistent fixed-size arrays of small integers, backed by a copy-on-write
//! B-tree over a flat arena.
//!
//! A search over millions of states, each differing from its predecessor by a
//! handful of entries, cannot afford one full array per state. The structures
//! in this crate share everything they can: an update copies only the O(log n)
//! nodes on the path from the root to the touched leaf, and returns a new root
//! handle. Old roots keep reading the old contents.
//!
//! # Versions
//! Copying every node on every update is still too much when a single logical
//! step performs many updates in a row. Callers therefore group updates into
//! *versions* (see [`PersistentCounters::new_version`]): a node allocated in
//! the current version is mutated in place, while nodes stamped with an older
//! version are copied first. Handles obtained before the last `new_version`
//! call are stable; handles from the current version alias the most recent
//! contents.
//!
//! # Representation
//! All nodes live in one growable arena of `u32` words, `1 + B` words per
//! node: a version stamp followed by `B` child handles (interior nodes) or
//! `B` words of packed slots (leaves). Handles are word offsets into the
//! arena, so dropping the structure frees every version at once.
//!
//! Two instantiations are exposed: [`PersistentCounters`] with 2-bit
//! saturating slots, and [`PersistentBitSet`] with 1-bit slots.

mod bitset;
mod counters;
mod store;
#[cfg(test)]
mod tests;

pub use bitset::PersistentBitSet;
pub use counters::PersistentCounters;
pub use store::NodeRef;
