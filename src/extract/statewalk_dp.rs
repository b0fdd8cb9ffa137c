//! Dynamic-programming search for a minimum-cost state walk.
//!
//! A search state is (current effectful class, set of classes the walk so
//! far has made extractable). Expanding a state follows one parent edge of
//! the current class upward and re-saturates the pure closure of the grown
//! set. The state space is exponential in the worst case; it stays tractable
//! through structural sharing of the sets (persistent bitsets and counter
//! arrays), hash-based unification of equal sets, liveness masking of
//! classes that cannot matter any more, and suppression of redundant
//! satellite expansions.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use persistent_btree::{NodeRef, PersistentBitSet, PersistentCounters};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::cost::Cost;
use crate::egraph::{ClassId, EGraph, NodeId, StateWalk, UNEXTRACTABLE};
use crate::region::find_arg;
use crate::validate;

/// Above this many satellites on one class, duplicate satellite expansions
/// are suppressed.
const SATELLITE_BAR: usize = 6;

/// Fixed seed for the per-class hash base vectors, so identical inputs
/// explore identical state spaces.
const HASH_SEED: u64 = 0x7157_a7e3_a1c5;

const NO_STATE: usize = usize::MAX;

struct DpState {
    cost: Cost,
    /// Root of the persistent extractable bitset.
    bits: NodeRef,
    prev: usize,
    class: ClassId,
    pick: NodeId,
}

/// Book-keeping attached to each canonical bitset root.
#[derive(Clone, Copy)]
struct BitsInfo {
    true_hash: u64,
    masked_hash: u64,
    /// Root of the persistent unsatisfied-child counter array.
    counters: NodeRef,
}

#[inline]
fn bit(words: &[u64], i: usize) -> bool {
    (words[i >> 6] >> (i & 63)) & 1 != 0
}

#[inline]
fn set_bit(words: &mut [u64], i: usize) {
    words[i >> 6] |= 1 << (i & 63);
}

/// Find the best state walk from `root` down to the region's argument.
/// `statewalk_cost` must cover every effectful node of `g`. When `stat` is
/// given, the search saturates cost ties before stopping and reports the DP
/// frontier width per effectful class.
pub fn statewalk_dp(
    g: &EGraph,
    root: ClassId,
    statewalk_cost: &[Vec<Cost>],
    use_liveness: bool,
    use_satellite: bool,
    mut stat: Option<&mut Vec<usize>>,
) -> StateWalk {
    let n = g.n_classes();
    let (argc, argn) = find_arg(g);
    let init_cost = statewalk_cost[argc][argn];

    let mut parent_edge_to_pure: Vec<Vec<(ClassId, NodeId)>> = vec![Vec::new(); n];
    let mut parent_edge_to_effectful: Vec<Vec<(ClassId, NodeId)>> = vec![Vec::new(); n];
    let mut enode_cnt: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (i, class) in g.classes.iter().enumerate() {
        if class.effectful {
            for (j, node) in class.nodes.iter().enumerate() {
                for &ch in &node.children {
                    if g[ch].effectful {
                        parent_edge_to_effectful[ch].push((i, j));
                    }
                }
            }
        } else {
            enode_cnt[i] = class.nodes.iter().map(|nd| nd.children.len() as u32).collect();
            for (j, node) in class.nodes.iter().enumerate() {
                for &ch in &node.children {
                    parent_edge_to_pure[ch].push((i, j));
                }
            }
        }
    }

    // Classes extractable before the walk even starts: the argument and the
    // pure closure of leaf classes.
    let mut init_extractable = vec![false; n];
    let mut queue = VecDeque::new();
    init_extractable[argc] = true;
    queue.push_back(argc);
    for (i, class) in g.classes.iter().enumerate() {
        if !class.effectful && class.nodes.iter().any(|nd| nd.children.is_empty()) {
            init_extractable[i] = true;
            queue.push_back(i);
        }
    }
    while let Some(u) = queue.pop_front() {
        for &(vc, vn) in &parent_edge_to_pure[u] {
            enode_cnt[vc][vn] -= 1;
            if enode_cnt[vc][vn] == 0 && !init_extractable[vc] {
                init_extractable[vc] = true;
                queue.push_back(vc);
            }
        }
    }

    // Flatten the remaining counters into one compressed address space. The
    // compressed ids deliberately exclude everything already extractable
    // (including the argument class).
    let mut rnk = vec![0usize; n];
    let mut init_cnt: Vec<u32> = Vec::new();
    let mut compressed = vec![UNEXTRACTABLE; n];
    let mut n_compressed = 0usize;
    for i in 0..n {
        if init_extractable[i] {
            enode_cnt[i].clear();
            continue;
        }
        compressed[i] = n_compressed;
        n_compressed += 1;
        if !enode_cnt[i].is_empty() {
            rnk[i] = init_cnt.len();
            // Shift the counters down by one so the whole range fits in the
            // 2-bit slots: a counter reads 0 exactly when one child remains.
            for &c in &enode_cnt[i] {
                debug_assert!(c > 0 && c <= 4);
                init_cnt.push(c - 1);
            }
        }
    }

    let mut counter_pool = PersistentCounters::new();
    let mut bitset_pool = PersistentBitSet::new();
    let init_cnt_root = counter_pool.init(&init_cnt);
    let init_bits_root = bitset_pool.init(n_compressed.max(1));

    let mut rng = StdRng::seed_from_u64(HASH_SEED);
    let base: Vec<u64> = (0..n_compressed).map(|_| rng.gen()).collect();

    // Liveness: per effectful class, the classes that any walk passing
    // through it could still touch on the way to the root. Classes outside
    // the set are dead and excluded from the dedup hash.
    let words = (n + 63) >> 6;
    let mut liveness: Vec<Vec<u64>> = vec![Vec::new(); n];
    let mut liveness_delta: Vec<FxHashMap<ClassId, Vec<usize>>> = vec![FxHashMap::default(); n];
    if use_liveness {
        for i in 0..n {
            if !g.classes[i].effectful {
                continue;
            }
            let mut live = vec![0u64; words];
            let mut q = VecDeque::new();
            q.push_back(i);
            while let Some(u) = q.pop_front() {
                if g[u].effectful && u != root {
                    for &(v, _) in &parent_edge_to_effectful[u] {
                        if !bit(&live, v) {
                            set_bit(&mut live, v);
                            q.push_back(v);
                        }
                    }
                }
                if bit(&live, u) {
                    for node in &g[u].nodes {
                        for &v in &node.children {
                            if !init_extractable[v] && !g[v].effectful && !bit(&live, v) {
                                set_bit(&mut live, v);
                                q.push_back(v);
                            }
                        }
                    }
                }
            }
            liveness[i] = live;
        }
        for i in 0..n {
            if !g.classes[i].effectful || i == root {
                continue;
            }
            for &(v, _) in &parent_edge_to_effectful[i] {
                liveness_delta[i].entry(v).or_insert_with(|| {
                    let mut dead = Vec::new();
                    for k in 0..words {
                        debug_assert_eq!(
                            liveness[i][k] & liveness[v][k],
                            liveness[v][k],
                            "parent liveness must be a subset"
                        );
                        let mut delta = liveness[i][k] ^ liveness[v][k];
                        while delta != 0 {
                            let w = (k << 6) + delta.trailing_zeros() as usize;
                            delta &= delta - 1;
                            if !g[w].effectful && !init_extractable[w] {
                                dead.push(compressed[w]);
                            }
                        }
                    }
                    dead
                });
            }
        }
    }

    // Satellites: classes whose every effectful edge, in and out, connects
    // to the same neighbour.
    let mut satellite_pa = vec![UNEXTRACTABLE; n];
    let mut satellite_cnt = vec![0usize; n];
    if use_satellite {
        for i in 0..n {
            if !g.classes[i].effectful {
                continue;
            }
            let mut candidate = UNEXTRACTABLE;
            let mut valid = true;
            for node in &g[i].nodes {
                let eff_child = node.children.iter().copied().find(|&ch| g[ch].effectful);
                match eff_child {
                    None => {
                        valid = false;
                        break;
                    }
                    Some(ch) if candidate == UNEXTRACTABLE => candidate = ch,
                    Some(ch) if candidate != ch => {
                        valid = false;
                        break;
                    }
                    Some(_) => {}
                }
            }
            if valid
                && candidate != UNEXTRACTABLE
                && !parent_edge_to_effectful[i].is_empty()
                && parent_edge_to_effectful[i].iter().all(|&(p, _)| p == candidate)
            {
                satellite_pa[i] = candidate;
            }
        }
        for i in 0..n {
            if satellite_pa[i] != UNEXTRACTABLE {
                satellite_cnt[satellite_pa[i]] += 1;
            }
        }
    }

    // Main DP tables. States are keyed per class by the liveness-masked
    // hash; equal true hashes share one canonical bitset root.
    let mut dp_map: Vec<FxHashMap<u64, usize>> = vec![FxHashMap::default(); n];
    let mut dp: Vec<DpState> = Vec::new();
    let mut bits_info: FxHashMap<NodeRef, BitsInfo> = FxHashMap::default();
    let mut unifier: FxHashMap<u64, NodeRef> = FxHashMap::default();
    let mut saturation_cache: FxHashMap<u64, NodeRef> = FxHashMap::default();

    dp_map[argc].insert(0, 0);
    dp.push(DpState {
        cost: init_cost,
        bits: init_bits_root,
        prev: NO_STATE,
        class: argc,
        pick: argn,
    });
    bits_info.insert(
        init_bits_root,
        BitsInfo {
            true_hash: 0,
            masked_hash: 0,
            counters: init_cnt_root,
        },
    );
    unifier.insert(0, init_bits_root);

    let mut heap = BinaryHeap::new();
    heap.push(Reverse((init_cost, 0usize)));
    let mut best = if root == argc { 0 } else { NO_STATE };
    let mut expanded = 0u64;

    while let Some(Reverse((c, uid))) = heap.pop() {
        // In statistics mode, saturate all cost ties before stopping so the
        // frontier widths are not cut short by an early exit.
        if stat.is_some() && best != NO_STATE && dp[uid].cost == dp[best].cost {
            break;
        }
        if dp[uid].cost != c || dp[uid].class == root {
            continue;
        }
        let u = dp[uid].class;
        let u_bits = dp[uid].bits;
        expanded += 1;
        if expanded % 100_000 == 0 {
            log::info!(
                "statewalk dp: expanded {} states, heap {}, table {}",
                expanded,
                heap.len(),
                dp.len()
            );
        }
        let enable_satellite = use_satellite && satellite_cnt[u] > SATELLITE_BAR;
        let mut satellite_updated = false;
        for idx in 0..parent_edge_to_effectful[u].len() {
            let (v, vn) = parent_edge_to_effectful[u][idx];
            let is_satellite = use_satellite && satellite_pa[v] == u;
            if enable_satellite && is_satellite && satellite_updated {
                continue;
            }
            let node = g.node(v, vn);
            let extendable = node.children.iter().all(|&ch| {
                init_extractable[ch] || bitset_pool.get(u_bits, compressed[ch])
            });
            if !extendable {
                continue;
            }
            let info = bits_info[&u_bits];
            let nc = c.saturating_add(statewalk_cost[v][vn]);
            if best != NO_STATE && dp[best].cost <= nc {
                continue;
            }
            let (nroot, nhash);
            if init_extractable[v] || bitset_pool.get(u_bits, compressed[v]) {
                nroot = u_bits;
                nhash = info.masked_hash;
            } else {
                let cache_key = ((u_bits as u64) << 32) | v as u64;
                if let Some(cached) = saturation_cache.get(&cache_key).copied() {
                    nroot = cached;
                    nhash = bits_info[&cached].masked_hash;
                } else {
                    counter_pool.new_version();
                    bitset_pool.new_version();
                    let mut cur = u_bits;
                    let mut ninfo = info;
                    if use_liveness {
                        // Classes only the downward part of the walk could
                        // have used are dead from here on; drop them from
                        // the masked hash.
                        if let Some(dead) = liveness_delta[u].get(&v) {
                            for &d in dead {
                                if bitset_pool.get(cur, d) {
                                    ninfo.masked_hash ^= base[d];
                                }
                            }
                        }
                    }
                    let v_live = &liveness[v];
                    let mut q = VecDeque::new();
                    q.push_back(v);
                    cur = bitset_pool.set(cur, compressed[v]).0;
                    ninfo.true_hash ^= base[compressed[v]];
                    while let Some(uu) = q.pop_front() {
                        for &(pc, pn) in &parent_edge_to_pure[uu] {
                            if init_extractable[pc] || bitset_pool.get(cur, compressed[pc]) {
                                continue;
                            }
                            let (na, old) = counter_pool.dec(ninfo.counters, rnk[pc] + pn);
                            ninfo.counters = na;
                            if old == 0 {
                                let (nr, was_set) = bitset_pool.set(cur, compressed[pc]);
                                if !was_set {
                                    cur = nr;
                                    ninfo.true_hash ^= base[compressed[pc]];
                                    if !use_liveness || bit(v_live, pc) {
                                        ninfo.masked_hash ^= base[compressed[pc]];
                                    }
                                    q.push_back(pc);
                                }
                            }
                        }
                    }
                    if let Some(canon) = unifier.get(&ninfo.true_hash).copied() {
                        debug_assert_eq!(bits_info[&canon].masked_hash, ninfo.masked_hash);
                        cur = canon;
                    } else {
                        unifier.insert(ninfo.true_hash, cur);
                        bits_info.insert(cur, ninfo);
                    }
                    saturation_cache.insert(cache_key, cur);
                    nroot = cur;
                    nhash = ninfo.masked_hash;
                }
            }
            if enable_satellite && is_satellite {
                if nhash == info.masked_hash {
                    continue;
                }
                satellite_updated = true;
            }
            match dp_map[v].get(&nhash).copied() {
                None => {
                    let vid = dp.len();
                    dp_map[v].insert(nhash, vid);
                    dp.push(DpState {
                        cost: nc,
                        bits: nroot,
                        prev: uid,
                        class: v,
                        pick: vn,
                    });
                    heap.push(Reverse((nc, vid)));
                    if v == root {
                        best = vid;
                    }
                }
                Some(vid) => {
                    if dp[vid].cost > nc {
                        dp[vid].cost = nc;
                        dp[vid].bits = nroot;
                        dp[vid].prev = uid;
                        dp[vid].pick = vn;
                        heap.push(Reverse((nc, vid)));
                        if v == root {
                            best = vid;
                        }
                    }
                }
            }
        }
    }

    if best == NO_STATE {
        eprintln!("Error: Unextractable region!");
        validate::dump_egraph(g);
        eprintln!("root: {}", root);
        eprintln!("arg: {}", argc);
        std::process::exit(1);
    }

    if let Some(stat) = stat.as_mut() {
        for i in 0..n {
            if g.classes[i].effectful {
                stat.push(dp_map[i].len());
            }
        }
    }

    let mut sw = StateWalk::new();
    let mut cur = best;
    while cur != NO_STATE {
        sw.push((dp[cur].class, dp[cur].pick));
        cur = dp[cur].prev;
    }
    debug_assert!(validate::is_valid_statewalk(g, root, &sw));
    sw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::compute_statewalk_cost;
    use crate::test_graphs::GraphBuilder;

    #[test]
    fn trivial_region_walks_its_argument() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);
        let sw = statewalk_dp(&g, arg, &table, true, true, None);
        assert_eq!(sw, vec![(arg, 0)]);
    }

    #[test]
    fn linear_region_walks_every_class() {
        let mut b = GraphBuilder::new();
        let c = b.class(true);
        b.node(c, "Arg", &[]);
        let bb = b.class(true);
        b.node(bb, "Print", &[c]);
        let a = b.class(true);
        b.node(a, "Print", &[bb]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);
        let sw = statewalk_dp(&g, a, &table, true, true, None);
        assert_eq!(sw, vec![(a, 0), (bb, 0), (c, 0)]);
    }

    #[test]
    fn branching_region_picks_the_cheaper_node() {
        let mut b = GraphBuilder::new();
        let c = b.class(true);
        b.node(c, "Arg", &[]);
        let bb = b.class(true);
        b.node(bb, "Print", &[c]);
        let a = b.class(true);
        b.node(a, "Alloc", &[bb]); // 1000
        b.node(a, "Print", &[bb]); // 500
        let g = b.build();
        let table = compute_statewalk_cost(&g);
        let sw = statewalk_dp(&g, a, &table, true, true, None);
        assert_eq!(sw, vec![(a, 1), (bb, 0), (c, 0)]);
    }

    #[test]
    fn walk_waits_for_pure_dependencies() {
        // The cheap root node hops straight from the argument, but its pure
        // operand only becomes extractable once `mid` is on the walk, so the
        // DP has to take the longer route through the dearer node.
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let mid = b.class(true);
        b.node(mid, "Print", &[arg]);
        let pure = b.class(false);
        b.node(pure, "Get", &[mid]);
        let root = b.class(true);
        b.node(root, "Write", &[arg, pure]); // blocked: pure needs mid
        b.node(root, "Free", &[mid]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);
        let sw = statewalk_dp(&g, root, &table, true, true, None);
        assert_eq!(sw, vec![(root, 1), (mid, 0), (arg, 0)]);
    }

    #[test]
    fn pruning_configurations_agree_on_cost() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let x = b.class(true);
        b.node(x, "Print", &[arg]);
        b.node(x, "Load", &[arg]);
        let y = b.class(true);
        b.node(y, "Print", &[x]);
        b.node(y, "Write", &[arg]);
        let root = b.class(true);
        b.node(root, "Free", &[y]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);

        let cost_of = |sw: &StateWalk| -> Cost {
            sw.iter().map(|&(c, n)| table[c][n]).sum()
        };
        let reference = cost_of(&statewalk_dp(&g, root, &table, false, false, None));
        for (live, sat) in [(true, false), (false, true), (true, true)] {
            let sw = statewalk_dp(&g, root, &table, live, sat, None);
            assert_eq!(cost_of(&sw), reference);
        }
        // Determinism: the same configuration twice returns the same walk.
        assert_eq!(
            statewalk_dp(&g, root, &table, true, true, None),
            statewalk_dp(&g, root, &table, true, true, None)
        );
    }

    #[test]
    fn stat_mode_reports_widths() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let mid = b.class(true);
        b.node(mid, "Print", &[arg]);
        let root = b.class(true);
        b.node(root, "Print", &[mid]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);
        let mut widths = Vec::new();
        statewalk_dp(&g, root, &table, true, true, Some(&mut widths));
        // One width entry per effectful class, each frontier a single state.
        assert_eq!(widths, vec![1, 1, 1]);
    }
}
