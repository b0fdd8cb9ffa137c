//! Turning a state walk into an extraction.
//!
//! The region graph is rebuilt with every effectful node deleted and only
//! the walk's nodes re-inserted, each wired to the next walk entry. A class
//! the walk visits twice is split into fresh classes so the rebuilt graph is
//! linear by construction. What remains is a greedy harvest of the pure
//! fringe around the walk.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::cost::{enode_cost, BagCost, Cost};
use crate::egraph::{
    inverse_mapping, parents_index, project_extraction, prune_unextractable, child_counters,
    ClassId, EClass, EGraph, EGraphMapping, Extraction, ExtractionNode, StateWalk, UNEXTRACTABLE,
};
use crate::extract::statewalk_dp::statewalk_dp;
use crate::validate;

/// Rebuild `g` around the walk. Returns the rebuilt graph and its mapping
/// back to `g` (child-consistent; fresh split classes map to the walk's
/// originals).
pub fn rebuild_with_walk(g: &EGraph, sw: &StateWalk) -> (EGraph, EGraphMapping) {
    let mut gp = EGraph::default();
    let mut gp2g = EGraphMapping {
        class_map: Vec::with_capacity(g.n_classes()),
        node_map: Vec::with_capacity(g.n_classes()),
    };
    for (i, class) in g.classes.iter().enumerate() {
        gp2g.class_map.push(i);
        if class.effectful {
            gp.classes.push(EClass {
                nodes: Vec::new(),
                effectful: true,
            });
            gp2g.node_map.push(Vec::new());
        } else {
            gp.classes.push(class.clone());
            gp2g.node_map.push((0..class.nodes.len()).collect());
        }
    }

    let mut last = UNEXTRACTABLE;
    for &(uc, un) in sw.iter().rev() {
        let vc;
        if gp.classes[uc].nodes.is_empty() {
            gp.classes[uc].nodes.push(g.node(uc, un).clone());
            vc = uc;
            gp2g.node_map[vc].push(un);
        } else {
            // The class is already occupied by a later walk entry; split.
            vc = gp.n_classes();
            let mut node = g.node(uc, un).clone();
            node.class = vc;
            gp.classes.push(EClass {
                nodes: vec![node],
                effectful: true,
            });
            gp2g.class_map.push(uc);
            gp2g.node_map.push(vec![un]);
        }
        for ch in &mut gp.classes[vc].nodes[0].children {
            if g[*ch].effectful {
                *ch = last;
            }
        }
        last = vc;
    }
    debug_assert!(validate::is_wellformed_egraph(&gp, true, false));
    debug_assert!(validate::is_valid_mapping(
        &gp2g, &gp, g, false, false, false, true
    ));
    (gp, gp2g)
}

/// Greedy extraction aware of the walk: the moment an effectful class is
/// emitted, it and its whole emitted subtree become free, and their pure
/// parents are immediately re-examined.
pub fn walk_greedy_extraction(g: &EGraph, root: ClassId) -> Extraction {
    let n = g.n_classes();
    let mut pick = vec![UNEXTRACTABLE; n];
    let mut dis: Vec<BagCost> = (0..n).map(|_| BagCost::infinite()).collect();
    let mut heap: BinaryHeap<Reverse<(Cost, ClassId)>> = BinaryHeap::new();
    let parents = parents_index(g);
    let mut counts = child_counters(g);

    for (i, class) in g.classes.iter().enumerate() {
        for (j, node) in class.nodes.iter().enumerate() {
            if node.children.is_empty() {
                let ndis = BagCost::new(enode_cost(node));
                if ndis.sum < dis[i].sum {
                    dis[i] = ndis;
                    pick[i] = j;
                    heap.push(Reverse((dis[i].sum, i)));
                }
            }
        }
    }

    let mut e = Extraction::new();
    let mut extracted = vec![UNEXTRACTABLE; n];
    let mut buf_id = vec![UNEXTRACTABLE; n];
    let mut processed = vec![false; n];

    while let Some(Reverse((d, i))) = heap.pop() {
        if d != dis[i].sum {
            continue;
        }
        if g.classes[i].effectful {
            // Emit this walk node together with every not-yet-emitted class
            // under its picked subtree, in dependency order.
            let mut buf = vec![i];
            let mut edges: Vec<Vec<usize>> = vec![Vec::new()];
            let mut pending = vec![0usize];
            buf_id[i] = 0;
            let mut bi = 0;
            while bi < buf.len() {
                let u = buf[bi];
                let node = g.node(u, pick[u]);
                for &v in &node.children {
                    if extracted[v] == UNEXTRACTABLE {
                        if buf_id[v] == UNEXTRACTABLE {
                            buf_id[v] = buf.len();
                            buf.push(v);
                            edges.push(Vec::new());
                            pending.push(0);
                        }
                        edges[buf_id[v]].push(bi);
                        pending[bi] += 1;
                    }
                }
                bi += 1;
            }
            let mut order: Vec<usize> = (0..buf.len()).filter(|&b| pending[b] == 0).collect();
            let mut oi = 0;
            while oi < order.len() {
                let u = order[oi];
                for &v in &edges[u] {
                    pending[v] -= 1;
                    if pending[v] == 0 {
                        order.push(v);
                    }
                }
                oi += 1;
            }
            debug_assert_eq!(order.len(), buf.len());
            let base = e.len();
            for (offset, &b) in order.iter().enumerate() {
                let u = buf[b];
                extracted[u] = base + offset;
                e.push(ExtractionNode {
                    c: u,
                    n: pick[u],
                    children: Vec::new(),
                });
            }
            for &b in &order {
                let u = buf[b];
                let node = g.node(u, pick[u]);
                e[extracted[u]].children = node.children.iter().map(|&v| extracted[v]).collect();
            }
            // Everything just emitted is paid for; zero it out and requeue
            // so pure parents see the discount right away.
            for &b in &order {
                let u = buf[b];
                if dis[u].sum > 0 {
                    dis[u].sum = 0;
                    dis[u].bag.clear();
                    if u != i {
                        heap.push(Reverse((0, u)));
                    }
                }
            }
        }
        if i == root {
            break;
        }
        for &(pc, pn) in &parents[i] {
            let ready = if processed[i] || counts[pc][pn] == 0 {
                counts[pc][pn] == 0
            } else {
                counts[pc][pn] -= 1;
                counts[pc][pn] == 0
            };
            if ready {
                let node = g.node(pc, pn);
                let mut ndis = if g.classes[pc].effectful {
                    BagCost::new(0)
                } else {
                    BagCost::new(enode_cost(node))
                };
                for &ch in &node.children {
                    ndis.absorb(ch, &dis[ch]);
                }
                if ndis.sum < dis[pc].sum {
                    dis[pc] = ndis;
                    pick[pc] = pn;
                    heap.push(Reverse((dis[pc].sum, pc)));
                }
            }
        }
        processed[i] = true;
    }

    if extracted[root] == UNEXTRACTABLE {
        eprintln!("Error: walk extraction never reached the root");
        validate::dump_egraph(g);
        std::process::exit(1);
    }
    debug_assert!(validate::is_effect_safe_extraction(g, root, &e));
    e
}

/// Extract a region along `sw`: rebuild, prune, harvest, and project back to
/// the region's own ids.
pub fn extract_with_walk(g: &EGraph, root: ClassId, sw: &StateWalk) -> Extraction {
    let (gp, gp2g) = rebuild_with_walk(g, sw);
    let (gpp, gp2gpp) = prune_unextractable(&gp, Some(root));
    let nroot = gp2gpp.class_map[root];
    if nroot == UNEXTRACTABLE {
        eprintln!("Error: region root unextractable along the chosen walk");
        validate::dump_egraph(&gp);
        std::process::exit(1);
    }
    let e = walk_greedy_extraction(&gpp, nroot);
    let e = project_extraction(&inverse_mapping(&gpp, &gp2gpp), &e);
    let e = project_extraction(&gp2g, &e);
    debug_assert!(validate::is_effect_safe_extraction(g, root, &e));
    e
}

/// The full state-walk engine for one regionalised graph.
pub fn extract_region_statewalk(
    g: &EGraph,
    root: ClassId,
    statewalk_cost: &[Vec<Cost>],
    use_liveness: bool,
    use_satellite: bool,
) -> Extraction {
    let sw = statewalk_dp(g, root, statewalk_cost, use_liveness, use_satellite, None);
    extract_with_walk(g, root, &sw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::compute_statewalk_cost;
    use crate::test_graphs::GraphBuilder;

    #[test]
    fn rebuild_deletes_off_walk_effectful_nodes() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let mid = b.class(true);
        b.node(mid, "Print", &[arg]);
        let root = b.class(true);
        b.node(root, "Print", &[mid]);
        b.node(root, "Load", &[arg]);
        let g = b.build();

        let sw = vec![(root, 1), (arg, 0)];
        let (gp, gp2g) = rebuild_with_walk(&g, &sw);
        // Only the walk nodes survive in effectful classes.
        assert_eq!(gp[root].nodes.len(), 1);
        assert_eq!(gp[root].nodes[0].op(), "Load");
        assert!(gp[mid].nodes.is_empty());
        assert_eq!(gp2g.node_map[root], vec![1]);
    }

    #[test]
    fn rebuild_splits_reused_classes() {
        // A walk that visits the same class twice must split it so each
        // occurrence owns one node.
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let twice = b.class(true);
        b.node(twice, "Print", &[arg]);
        b.node(twice, "Load", &[twice]);
        let g = b.build();

        let sw = vec![(twice, 1), (twice, 0), (arg, 0)];
        let (gp, gp2g) = rebuild_with_walk(&g, &sw);
        assert_eq!(gp.n_classes(), 3);
        let split = 2;
        assert_eq!(gp2g.class_map[split], twice);
        // The earlier (upper) entry lands in the fresh class, chained onto
        // the later one.
        assert_eq!(gp[split].nodes[0].op(), "Load");
        assert_eq!(gp[split].nodes[0].children, vec![twice]);
    }

    #[test]
    fn pure_fringe_is_harvested_around_the_walk() {
        // Function root is reached through pure classes hanging off the walk.
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let eff = b.class(true);
        b.node(eff, "Print", &[arg]);
        let p = b.class(false);
        b.node(p, "Get", &[eff]);
        let root = b.class(true);
        b.node(root, "Write", &[eff, p]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);

        let e = extract_region_statewalk(&g, root, &table, true, true);
        assert_eq!(e.last().unwrap().c, root);
        assert!(e.iter().any(|rec| rec.c == p));
        assert!(validate::is_effect_safe_extraction(&g, root, &e));
    }

    #[test]
    fn cheaper_pure_node_wins_the_fringe() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let x = b.class(false);
        b.node(x, "Const", &[]);
        let p = b.class(false);
        b.node(p, "FDiv", &[x, x]);
        b.node(p, "Add", &[x, x]);
        let root = b.class(true);
        b.node(root, "Write", &[arg, p]);
        let g = b.build();
        let table = compute_statewalk_cost(&g);

        let e = extract_region_statewalk(&g, root, &table, true, true);
        let chosen = e.iter().find(|rec| rec.c == p).unwrap();
        assert_eq!(g.node(p, chosen.n).op(), "Add");
    }

    #[test]
    fn trivial_walk_yields_single_node_extraction() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let g = b.build();
        let e = extract_with_walk(&g, arg, &vec![(arg, 0)]);
        assert_eq!(e.len(), 1);
        assert_eq!((e[0].c, e[0].n), (arg, 0));
    }
}
