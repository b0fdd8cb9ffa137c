//! Structural validators. Every predicate returns `bool` and, on failure,
//! prints a diagnostic plus a dump of the offending object to stderr; callers
//! decide whether the failure is fatal. No error values cross module
//! boundaries — a failed invariant here means a bug elsewhere, not a
//! condition to recover from.

use std::collections::VecDeque;

use crate::egraph::{
    ClassId, EGraph, EGraphMapping, Extraction, ExtractionId, StateWalk, UNEXTRACTABLE,
};

/// Text dump in the exchange format: class count, then per class the
/// effectful flag and nodes. Effectful children are marked with `!`.
pub fn dump_egraph(g: &EGraph) {
    eprintln!("# eclasses: {}", g.n_classes());
    eprintln!("# enodes: {}", g.n_nodes());
    for (i, class) in g.classes.iter().enumerate() {
        eprintln!("# eclass {}", i);
        eprintln!(
            "{} {}",
            if class.effectful { 1 } else { 0 },
            class.nodes.len()
        );
        for node in &class.nodes {
            eprintln!("{}", node.head);
            let children: Vec<String> = node
                .children
                .iter()
                .map(|&ch| {
                    if ch == UNEXTRACTABLE {
                        "!-".to_string()
                    } else if g[ch].effectful {
                        format!("!{}", ch)
                    } else {
                        format!(" {}", ch)
                    }
                })
                .collect();
            eprintln!("{} {}", node.children.len(), children.join(" "));
        }
        eprintln!();
    }
}

pub fn dump_extraction(g: &EGraph, e: &Extraction) {
    for (i, rec) in e.iter().enumerate() {
        let mark = if g[rec.c].effectful { '!' } else { ' ' };
        let children: Vec<String> = rec.children.iter().map(|c| format!("#{}", c)).collect();
        eprintln!(
            "#{} {}{} {} {} {}",
            i,
            rec.c,
            mark,
            rec.n,
            g.node(rec.c, rec.n).head,
            children.join(" ")
        );
    }
}

/// Structural sanity of a graph. `allow_sentinel_child` admits
/// [`UNEXTRACTABLE`] child edges (graphs mid-regionalisation);
/// `allow_subregion_child` admits nodes with more than one effectful child
/// (graphs that have not been regionalised yet).
pub fn is_wellformed_egraph(
    g: &EGraph,
    allow_sentinel_child: bool,
    allow_subregion_child: bool,
) -> bool {
    let mut ok = true;
    for (i, class) in g.classes.iter().enumerate() {
        if !allow_sentinel_child && class.nodes.is_empty() {
            ok = false;
            eprintln!("Error: Found empty eclass {}", i);
        }
        for (j, node) in class.nodes.iter().enumerate() {
            if node.class != i {
                ok = false;
                eprintln!("Error: Wrong eclass for enode {},{}", i, j);
            }
            let mut effectful_children = 0;
            for (k, &ch) in node.children.iter().enumerate() {
                let in_bounds = ch < g.n_classes();
                if !(in_bounds || (allow_sentinel_child && ch == UNEXTRACTABLE)) {
                    ok = false;
                    eprintln!("Error: Invalid child edge {},{},{}", i, j, k);
                    continue;
                }
                // Sentinel children stand in for effectful classes cut away
                // during regionalisation.
                if ch == UNEXTRACTABLE || g[ch].effectful {
                    effectful_children += 1;
                }
            }
            if !allow_subregion_child && effectful_children > 1 {
                ok = false;
                eprintln!("Error: Found subregion child at enode {},{}", i, j);
            }
        }
    }
    if !ok {
        dump_egraph(g);
    }
    ok
}

/// Check a mapping `g -> gp` against the four characterising predicates.
pub fn is_valid_mapping(
    g2gp: &EGraphMapping,
    g: &EGraph,
    gp: &EGraph,
    partial: bool,
    injective: bool,
    surjective: bool,
    child_consistent: bool,
) -> bool {
    let ok = is_valid_mapping_inner(g2gp, g, gp, partial, injective, surjective, child_consistent);
    if !ok {
        dump_egraph(g);
        dump_egraph(gp);
    }
    ok
}

fn is_valid_mapping_inner(
    g2gp: &EGraphMapping,
    g: &EGraph,
    gp: &EGraph,
    partial: bool,
    injective: bool,
    surjective: bool,
    child_consistent: bool,
) -> bool {
    if g2gp.class_map.len() != g.n_classes() || g2gp.node_map.len() != g.n_classes() {
        eprintln!("Error: Wrong mapping domain size");
        return false;
    }
    let mut hit: Vec<Vec<bool>> = gp
        .classes
        .iter()
        .map(|c| vec![false; c.nodes.len()])
        .collect();
    for (i, class) in g.classes.iter().enumerate() {
        if g2gp.node_map[i].len() != class.nodes.len() {
            eprintln!("Error: Wrong node domain size in eclass {}", i);
            return false;
        }
        let ci = g2gp.class_map[i];
        if ci == UNEXTRACTABLE {
            if !partial {
                eprintln!("Error: Total mapping leaves eclass {} unmapped", i);
                return false;
            }
            continue;
        }
        if ci >= gp.n_classes() {
            eprintln!("Error: Invalid codomain eclass {} for eclass {}", ci, i);
            return false;
        }
        if class.effectful != gp[ci].effectful {
            eprintln!("Error: Mismatching effectful flags, {} -> {}", i, ci);
            return false;
        }
        for (j, node) in class.nodes.iter().enumerate() {
            let nj = g2gp.node_map[i][j];
            if nj == UNEXTRACTABLE {
                if !partial {
                    eprintln!("Error: Total mapping leaves enode {},{} unmapped", i, j);
                    return false;
                }
                continue;
            }
            if nj >= gp[ci].nodes.len() {
                eprintln!("Error: Invalid codomain enode for {},{} -> {},{}", i, j, ci, nj);
                return false;
            }
            if injective && hit[ci][nj] {
                eprintln!("Error: Mapping not injective at {},{}", ci, nj);
                return false;
            }
            hit[ci][nj] = true;
            if child_consistent {
                let np = &gp[ci].nodes[nj];
                if node.children.len() != np.children.len() {
                    eprintln!("Error: Children arity mismatch, {},{} -> {},{}", i, j, ci, nj);
                    return false;
                }
                for (k, (&ch, &chp)) in node.children.iter().zip(&np.children).enumerate() {
                    if g2gp.class_map[ch] != chp {
                        eprintln!(
                            "Error: Child inconsistency at {},{} slot {} ({} -> {})",
                            i, j, k, ch, chp
                        );
                        return false;
                    }
                }
            }
        }
    }
    if surjective {
        for (i, class_hits) in hit.iter().enumerate() {
            for (j, &h) in class_hits.iter().enumerate() {
                if !h {
                    eprintln!("Error: Mapping not surjective onto {},{}", i, j);
                    return false;
                }
            }
        }
    }
    true
}

/// A regionalised graph must contain exactly one effectful zero-child node:
/// the region's argument.
pub fn arg_check_regionalized(g: &EGraph) -> bool {
    let mut arg_nodes = 0;
    let mut arg_classes = 0;
    for class in &g.classes {
        if !class.effectful {
            continue;
        }
        let here = class.nodes.iter().filter(|n| n.children.is_empty()).count();
        arg_nodes += here;
        if here > 0 {
            arg_classes += 1;
        }
    }
    let ok = arg_nodes == 1;
    if arg_nodes == 0 {
        eprintln!("Error: Found no arg in a regionalized egraph");
    } else if arg_nodes > 1 {
        eprintln!("Error: Found multiple arg enodes in a regionalized egraph: {}", arg_nodes);
        if arg_classes > 1 {
            eprintln!("Error: Found multiple arg eclasses: {}", arg_classes);
        }
    }
    if !ok {
        dump_egraph(g);
    }
    ok
}

/// A walk starts at `root`, follows the unique effectful child of each node,
/// and ends at a zero-child node.
pub fn is_valid_statewalk(g: &EGraph, root: ClassId, sw: &StateWalk) -> bool {
    let ok = is_valid_statewalk_inner(g, root, sw);
    if !ok {
        dump_egraph(g);
        for (c, n) in sw {
            eprintln!("{} {}", c, n);
        }
    }
    ok
}

fn is_valid_statewalk_inner(g: &EGraph, root: ClassId, sw: &StateWalk) -> bool {
    if sw.is_empty() || sw[0].0 != root {
        eprintln!("Error: Statewalk does not start with the root eclass");
        return false;
    }
    for (i, &(c, n)) in sw.iter().enumerate() {
        if c >= g.n_classes() {
            eprintln!("Error: Statewalk has an invalid eclass id");
            return false;
        }
        if n >= g[c].nodes.len() {
            eprintln!("Error: Statewalk has an invalid enode id");
            return false;
        }
        let node = g.node(c, n);
        if i + 1 < sw.len() {
            let eff_child = node
                .children
                .iter()
                .copied()
                .filter(|&ch| ch != UNEXTRACTABLE && g[ch].effectful)
                .last();
            match eff_child {
                None => {
                    eprintln!("Error: Statewalk prefix with no effectful connection");
                    return false;
                }
                Some(ch) if ch != sw[i + 1].0 => {
                    eprintln!("Error: Statewalk child eclass mismatch");
                    return false;
                }
                _ => {}
            }
        } else if !node.children.is_empty() {
            eprintln!("Error: Statewalk does not end with an arg");
            return false;
        }
    }
    true
}

/// Topological validity of an extraction against `g` and `root`.
pub fn is_valid_extraction(g: &EGraph, root: ClassId, e: &Extraction) -> bool {
    let ok = is_valid_extraction_inner(g, root, e);
    if !ok {
        dump_egraph(g);
        dump_extraction(g, e);
    }
    ok
}

fn is_valid_extraction_inner(g: &EGraph, root: ClassId, e: &Extraction) -> bool {
    if e.is_empty() || e[e.len() - 1].c != root {
        eprintln!("Error: The last element of the extraction must be the root.");
        return false;
    }
    for (i, rec) in e.iter().enumerate().rev() {
        if rec.c >= g.n_classes() {
            eprintln!("Error: Extraction referring to an eclass outside of bounds.");
            return false;
        }
        if rec.n >= g[rec.c].nodes.len() {
            eprintln!("Error: Extraction referring to an enode outside of bounds.");
            return false;
        }
        let node = g.node(rec.c, rec.n);
        if rec.children.len() != node.children.len() {
            eprintln!("Error: Extraction referring to a wrong number of children.");
            return false;
        }
        for (k, &ch) in rec.children.iter().enumerate() {
            if ch >= e.len() {
                eprintln!("Error: Extraction referring to an index outside of bounds: {}", ch);
                return false;
            }
            if e[ch].c != node.children[k] {
                eprintln!("Error: Extraction referring to a child of wrong eclass.");
                return false;
            }
            if ch >= i {
                eprintln!("Error: Extraction may contain a loop.");
                return false;
            }
        }
    }
    // Reachability and unique choice per class are intentionally not required.
    true
}

/// Effect-safety: within every region of the extraction, pure nodes may only
/// reach effectful nodes that lie on that region's state walk, and each walk
/// node hands the state to exactly one effectful child.
pub fn is_effect_safe_extraction(g: &EGraph, root: ClassId, e: &Extraction) -> bool {
    if !is_valid_extraction(g, root, e) {
        return false;
    }
    let mut region_checked = vec![false; e.len()];
    let ok = effect_safe_region(g, e.len() - 1, e, &mut region_checked);
    if !ok {
        dump_egraph(g);
        dump_extraction(g, e);
    }
    ok
}

fn effect_safe_region(
    g: &EGraph,
    region_root: ExtractionId,
    e: &Extraction,
    region_checked: &mut Vec<bool>,
) -> bool {
    if region_checked[region_root] {
        return true;
    }
    let mut walk = vec![region_root];
    let mut on_walk = vec![false; e.len()];
    let mut visited = vec![false; e.len()];
    let mut queue = VecDeque::new();
    on_walk[region_root] = true;
    let mut i = 0;
    while i < walk.len() {
        let u = walk[i];
        let mut next = None;
        for &ch in &e[u].children {
            if g[e[ch].c].effectful {
                if next.is_none() {
                    next = Some(ch);
                    walk.push(ch);
                    on_walk[ch] = true;
                } else if !effect_safe_region(g, ch, e, region_checked) {
                    return false;
                }
            } else if !visited[ch] {
                visited[ch] = true;
                queue.push_back(ch);
            }
        }
        i += 1;
    }
    while let Some(u) = queue.pop_front() {
        for &ch in &e[u].children {
            // Pure enodes carry at most one effectful child by construction.
            if g[e[ch].c].effectful {
                if !on_walk[ch] {
                    eprintln!("Error: Using an effectful node not on the region statewalk");
                    return false;
                }
            } else if !visited[ch] {
                visited[ch] = true;
                queue.push_back(ch);
            }
        }
    }
    region_checked[region_root] = true;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egraph::ExtractionNode;
    use crate::test_graphs::GraphBuilder;

    fn linear_region() -> (EGraph, ClassId) {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let mid = b.class(true);
        b.node(mid, "Print", &[arg]);
        let root = b.class(true);
        b.node(root, "Print", &[mid]);
        (b.build(), root)
    }

    #[test]
    fn wellformed_rejects_second_effectful_child() {
        let mut b = GraphBuilder::new();
        let a = b.class(true);
        b.node(a, "Arg", &[]);
        let c = b.class(true);
        b.node(c, "If", &[a, a]);
        let g = b.build();
        assert!(is_wellformed_egraph(&g, false, true));
        assert!(!is_wellformed_egraph(&g, false, false));
    }

    #[test]
    fn statewalk_validity() {
        let (g, root) = linear_region();
        assert!(is_valid_statewalk(&g, root, &vec![(2, 0), (1, 0), (0, 0)]));
        // Skipping the middle class breaks the chain.
        assert!(!is_valid_statewalk(&g, root, &vec![(2, 0), (0, 0)]));
        // Ending before the arg is not a walk.
        assert!(!is_valid_statewalk(&g, root, &vec![(2, 0), (1, 0)]));
    }

    #[test]
    fn extraction_validity_checks_topology() {
        let (g, root) = linear_region();
        let good = vec![
            ExtractionNode { c: 0, n: 0, children: vec![] },
            ExtractionNode { c: 1, n: 0, children: vec![0] },
            ExtractionNode { c: 2, n: 0, children: vec![1] },
        ];
        assert!(is_valid_extraction(&g, root, &good));
        let cyclic = vec![
            ExtractionNode { c: 0, n: 0, children: vec![] },
            ExtractionNode { c: 1, n: 0, children: vec![0] },
            ExtractionNode { c: 2, n: 0, children: vec![2] },
        ];
        assert!(!is_valid_extraction(&g, root, &cyclic));
    }

    #[test]
    fn effect_safety_catches_off_walk_use() {
        // root -> a (walk), but a pure parent reads effectful class b which
        // is not on the walk.
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let stray = b.class(true);
        b.node(stray, "Print", &[arg]);
        let pure = b.class(false);
        b.node(pure, "Get", &[stray]);
        let root = b.class(true);
        b.node(root, "Print", &[arg]);
        b.node(root, "Write", &[arg, pure]);
        let g = b.build();

        let safe = vec![
            ExtractionNode { c: arg, n: 0, children: vec![] },
            ExtractionNode { c: root, n: 0, children: vec![0] },
        ];
        assert!(is_effect_safe_extraction(&g, root, &safe));

        let unsafe_e = vec![
            ExtractionNode { c: arg, n: 0, children: vec![] },
            ExtractionNode { c: stray, n: 0, children: vec![0] },
            ExtractionNode { c: pure, n: 0, children: vec![1] },
            ExtractionNode { c: root, n: 1, children: vec![0, 2] },
        ];
        assert!(!is_effect_safe_extraction(&g, root, &unsafe_e));
    }
}
