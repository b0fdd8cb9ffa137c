//! Carving a function graph into regions and stitching per-region
//! extractions back together.
//!
//! A region is everything reachable from a region root while following at
//! most one effectful child per effectful node; the remaining effectful
//! children point at *sub-regions*, which are extracted independently (and
//! memoised, since a region extracts the same way no matter which function
//! pulls it in).

use indexmap::IndexSet;

use crate::config::{Config, Engine};
use crate::cost::{self, Cost};
use crate::egraph::{
    inverse_mapping, project_extraction, prune_unextractable, ClassId, EClass, EGraph,
    EGraphMapping, ENode, Extraction, ExtractionId, ExtractionNode, NodeId, UNEXTRACTABLE,
};
use crate::extract::{ilp, walk_rebuild};
use crate::validate;

pub struct Region {
    pub graph: EGraph,
    /// The region root's id inside [`Region::graph`].
    pub root: ClassId,
    /// Total injective mapping from region ids back to the parent graph.
    pub to_parent: EGraphMapping,
    /// Per region node, how many secondary effectful children were cut.
    pub n_subregion: Vec<Vec<u32>>,
}

/// Build the region subgraph rooted at `root`: BFS along single effectful
/// child edges, then along pure edges, rebuild with cut children replaced by
/// the sentinel, and re-prune (the cuts can orphan nodes).
pub fn construct_region(g: &EGraph, root: ClassId) -> Region {
    let mut order: Vec<ClassId> = vec![root];
    let mut region_id = vec![UNEXTRACTABLE; g.n_classes()];
    region_id[root] = 0;

    let mut i = 0;
    while i < order.len() {
        let u = order[i];
        for node in &g[u].nodes {
            let mut saw_effectful = false;
            for &v in &node.children {
                if g[v].effectful && !saw_effectful {
                    if region_id[v] == UNEXTRACTABLE {
                        region_id[v] = order.len();
                        order.push(v);
                    }
                    saw_effectful = true;
                }
            }
        }
        i += 1;
    }
    let mut i = 0;
    while i < order.len() {
        let u = order[i];
        for node in &g[u].nodes {
            for &v in &node.children {
                if !g[v].effectful && region_id[v] == UNEXTRACTABLE {
                    region_id[v] = order.len();
                    order.push(v);
                }
            }
        }
        i += 1;
    }

    let mut gr = EGraph::default();
    for (i, &u) in order.iter().enumerate() {
        let mut nc = EClass {
            nodes: Vec::new(),
            effectful: g[u].effectful,
        };
        for node in &g[u].nodes {
            let mut nn = ENode {
                head: node.head.clone(),
                class: i,
                children: Vec::new(),
            };
            let mut saw_effectful = false;
            for &v in &node.children {
                if g[v].effectful {
                    if saw_effectful {
                        continue;
                    }
                    saw_effectful = true;
                }
                nn.children.push(region_id[v]);
            }
            nc.nodes.push(nn);
        }
        gr.classes.push(nc);
    }
    debug_assert!(validate::is_wellformed_egraph(&gr, true, false));

    let (grp, gr2grp) = prune_unextractable(&gr, Some(0));
    let nroot = gr2grp.class_map[0];
    if nroot == UNEXTRACTABLE {
        eprintln!("Error: Region root {} pruned away entirely", root);
        validate::dump_egraph(&gr);
        std::process::exit(1);
    }
    let mut grp2g = inverse_mapping(&grp, &gr2grp);
    for ci in grp2g.class_map.iter_mut() {
        // Compose with the order table so the mapping lands in the parent
        // graph rather than the intermediate region copy.
        *ci = order[*ci];
    }
    debug_assert!(validate::is_valid_mapping(
        &grp2g, &grp, g, false, true, false, false
    ));

    let n_subregion = grp
        .classes
        .iter()
        .enumerate()
        .map(|(c, class)| {
            (0..class.nodes.len())
                .map(|n| {
                    let orig = g.node(grp2g.class_map[c], grp2g.node_map[c][n]);
                    let effectful = orig
                        .children
                        .iter()
                        .filter(|&&v| g[v].effectful)
                        .count() as u32;
                    effectful.saturating_sub(1)
                })
                .collect()
        })
        .collect();

    Region {
        graph: grp,
        root: nroot,
        to_parent: grp2g,
        n_subregion,
    }
}

/// Region roots: the function roots plus every class referenced as a
/// secondary effectful child somewhere in the graph.
pub fn find_region_roots(g: &EGraph, fun_roots: &[ClassId]) -> Vec<ClassId> {
    let mut roots: IndexSet<ClassId> = fun_roots.iter().copied().collect();
    for class in &g.classes {
        if !class.effectful {
            continue;
        }
        for node in &class.nodes {
            let mut saw_effectful = false;
            for &v in &node.children {
                if g[v].effectful {
                    if saw_effectful {
                        roots.insert(v);
                    } else {
                        saw_effectful = true;
                    }
                }
            }
        }
    }
    roots.into_iter().collect()
}

#[derive(Default)]
struct RegionCache {
    /// Extraction in parent-graph ids, computed at most once per region.
    extraction: Option<Extraction>,
    /// Where this region's root landed in the extraction currently being
    /// assembled; reset between functions.
    spliced_at: Option<ExtractionId>,
}

/// Extract the region rooted at `root` using the configured engine,
/// projected back to parent-graph ids.
pub fn extract_region_once(
    g: &EGraph,
    root: ClassId,
    statewalk_cost: &[Vec<Cost>],
    config: &Config,
) -> Extraction {
    let region = construct_region(g, root);
    log::info!(
        "region root {}: graph size {}, region size {}",
        root,
        g.n_classes(),
        region.graph.n_classes()
    );
    let projected = cost::project_statewalk_cost(&region.to_parent, &region.n_subregion, statewalk_cost);
    let er = match config.engine() {
        Engine::Statewalk => walk_rebuild::extract_region_statewalk(
            &region.graph,
            region.root,
            &projected,
            true,
            true,
        ),
        Engine::Ilp => {
            let (outcome, _) = ilp::extract_region_ilp(&region.graph, region.root, &projected, config);
            match outcome {
                ilp::IlpOutcome::Extraction(e) => e,
                ilp::IlpOutcome::TimedOut => {
                    println!("TIMEOUT");
                    std::process::exit(1);
                }
                ilp::IlpOutcome::Infeasible => {
                    eprintln!("Error: ILP reported infeasibility for region root {}", root);
                    validate::dump_egraph(&region.graph);
                    std::process::exit(1);
                }
                ilp::IlpOutcome::Failed => std::process::exit(1),
            }
        }
    };
    project_extraction(&region.to_parent, &er)
}

fn extract_region(
    g: &EGraph,
    root: ClassId,
    e: &mut Extraction,
    region_ids: &[usize],
    cache: &mut [RegionCache],
    statewalk_cost: &[Vec<Cost>],
    config: &Config,
) -> ExtractionId {
    let rid = region_ids[root];
    if let Some(at) = cache[rid].spliced_at {
        return at;
    }
    if cache[rid].extraction.is_none() {
        cache[rid].extraction = Some(extract_region_once(g, root, statewalk_cost, config));
    }
    let region_e = cache[rid].extraction.clone().unwrap();

    // Descend into sub-regions first so their roots precede our nodes.
    let mut subregions = Vec::new();
    for rec in &region_e {
        let node = g.node(rec.c, rec.n);
        let mut saw_effectful = false;
        for &v in &node.children {
            if g[v].effectful {
                if saw_effectful {
                    subregions.push(extract_region(
                        g,
                        v,
                        e,
                        region_ids,
                        cache,
                        statewalk_cost,
                        config,
                    ));
                } else {
                    saw_effectful = true;
                }
            }
        }
    }

    // Renumber the region extraction into the assembled frame, wiring the
    // secondary effectful slots to the sub-region roots.
    let base = e.len();
    let mut next_sub = 0;
    for rec in &region_e {
        let node = g.node(rec.c, rec.n);
        let mut children = Vec::with_capacity(node.children.len());
        let mut saw_effectful = false;
        let mut k = 0;
        for &v in &node.children {
            if g[v].effectful {
                if saw_effectful {
                    children.push(subregions[next_sub]);
                    next_sub += 1;
                    continue;
                }
                saw_effectful = true;
            }
            children.push(base + rec.children[k]);
            k += 1;
        }
        e.push(ExtractionNode {
            c: rec.c,
            n: rec.n,
            children,
        });
    }
    let at = e.len() - 1;
    cache[rid].spliced_at = Some(at);
    at
}

/// Extract every effectful function root of `g`. Pure roots are skipped (the
/// upstream rewriter keeps them as-is). Returns one extraction per extracted
/// root, in input order.
pub fn extract_all_function_roots(
    g: &EGraph,
    fun_roots: &[ClassId],
    config: &Config,
) -> Vec<(ClassId, Extraction)> {
    let effectful_roots: Vec<ClassId> = fun_roots
        .iter()
        .copied()
        .filter(|&r| {
            if g[r].effectful {
                true
            } else {
                log::warn!("skipping pure function root {}", r);
                false
            }
        })
        .collect();

    let region_roots = find_region_roots(g, &effectful_roots);
    let mut region_ids = vec![UNEXTRACTABLE; g.n_classes()];
    for (i, &r) in region_roots.iter().enumerate() {
        region_ids[r] = i;
    }

    let statewalk_cost = cost::compute_statewalk_cost(g);
    let mut cache: Vec<RegionCache> = (0..region_roots.len()).map(|_| RegionCache::default()).collect();

    let mut out = Vec::with_capacity(effectful_roots.len());
    for &root in &effectful_roots {
        log::info!("function root {}", root);
        for entry in cache.iter_mut() {
            entry.spliced_at = None;
        }
        let mut e = Extraction::new();
        extract_region(g, root, &mut e, &region_ids, &mut cache, &statewalk_cost, config);
        if !validate::is_effect_safe_extraction(g, root, &e) {
            eprintln!("Error: extraction for function root {} is not effect-safe", root);
            std::process::exit(1);
        }
        out.push((root, e));
    }
    out
}

/// Locate the region's argument: its unique effectful zero-child node.
pub fn find_arg(g: &EGraph) -> (ClassId, NodeId) {
    debug_assert!(validate::arg_check_regionalized(g));
    for (i, class) in g.classes.iter().enumerate() {
        if !class.effectful {
            continue;
        }
        for (j, node) in class.nodes.iter().enumerate() {
            if node.children.is_empty() {
                return (i, j);
            }
        }
    }
    eprintln!("Error: Failed to find arg!");
    validate::dump_egraph(g);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_graphs::{test_config, GraphBuilder};

    /// root --Write--> mid --Print--> arg, with a second effectful child of
    /// the Write pointing into a sub-region.
    fn graph_with_subregion() -> (EGraph, ClassId, ClassId) {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let sub = b.class(true);
        b.node(sub, "Print", &[arg]);
        let mid = b.class(true);
        b.node(mid, "Print", &[arg]);
        let root = b.class(true);
        b.node(root, "Write", &[mid, sub]);
        (b.build(), root, sub)
    }

    #[test]
    fn region_cuts_secondary_effectful_children() {
        let (g, root, _) = graph_with_subregion();
        let region = construct_region(&g, root);
        assert!(validate::arg_check_regionalized(&region.graph));
        // arg, mid, root survive; the sub-region class does not.
        assert_eq!(region.graph.n_classes(), 3);
        let root_row = &region.n_subregion[region.root];
        assert_eq!(root_row, &vec![1]);
        // The kept node lost its second effectful child.
        assert_eq!(region.graph[region.root].nodes[0].children.len(), 1);
    }

    #[test]
    fn region_roots_include_secondary_children() {
        let (g, root, sub) = graph_with_subregion();
        let roots = find_region_roots(&g, &[root]);
        assert_eq!(roots, vec![root, sub]);
    }

    #[test]
    fn subregions_are_spliced_and_effect_safe() {
        let (g, root, sub) = graph_with_subregion();
        let config = test_config();
        let out = extract_all_function_roots(&g, &[root], &config);
        assert_eq!(out.len(), 1);
        let (r, e) = &out[0];
        assert_eq!(*r, root);
        assert_eq!(e.last().unwrap().c, root);
        // Both the primary walk and the sub-region walk are present.
        assert!(e.iter().any(|rec| rec.c == sub));
        assert!(validate::is_effect_safe_extraction(&g, root, e));
    }

    #[test]
    fn single_class_region_extracts_alone() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let g = b.build();
        let config = test_config();
        let out = extract_all_function_roots(&g, &[arg], &config);
        let (_, e) = &out[0];
        assert_eq!(e.len(), 1);
        assert_eq!((e[0].c, e[0].n), (arg, 0));
        assert!(e[0].children.is_empty());
    }
}
