//! The e-graph model: classes of equivalent nodes, extractions, and mappings
//! between graphs related by pruning or regionalisation.

use std::collections::VecDeque;

pub type ClassId = usize;
pub type NodeId = usize;
/// Position of a node within an [`Extraction`].
pub type ExtractionId = usize;

/// Sentinel for a class, node, or extraction slot that does not exist (a
/// pruned entity, or a child edge that leaves the current subgraph).
pub const UNEXTRACTABLE: usize = usize::MAX;

/// Separates the display name from the operator tag in a node head.
pub const HEAD_DELIM: &str = "###";

#[derive(Clone, Debug, PartialEq)]
pub struct ENode {
    /// `name###op`; `name` identifies the node in the upstream export, `op`
    /// is the operator the cost table and the rule printer work with.
    pub head: String,
    pub class: ClassId,
    pub children: Vec<ClassId>,
}

impl ENode {
    pub fn name(&self) -> &str {
        self.head
            .split_once(HEAD_DELIM)
            .map_or(self.head.as_str(), |(name, _)| name)
    }

    pub fn op(&self) -> &str {
        self.head
            .split_once(HEAD_DELIM)
            .map_or(self.head.as_str(), |(_, op)| op)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EClass {
    pub nodes: Vec<ENode>,
    pub effectful: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EGraph {
    pub classes: Vec<EClass>,
}

impl EGraph {
    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn n_nodes(&self) -> usize {
        self.classes.iter().map(|c| c.nodes.len()).sum()
    }

    pub fn node(&self, c: ClassId, n: NodeId) -> &ENode {
        &self.classes[c].nodes[n]
    }
}

impl std::ops::Index<ClassId> for EGraph {
    type Output = EClass;

    fn index(&self, index: ClassId) -> &EClass {
        &self.classes[index]
    }
}

/// One selected node. `children[i]` is the extraction position supplying the
/// node's `i`-th child class.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractionNode {
    pub c: ClassId,
    pub n: NodeId,
    pub children: Vec<ExtractionId>,
}

/// Topologically ordered: every child position precedes its parent, and the
/// last entry is the root.
pub type Extraction = Vec<ExtractionNode>;

/// The chosen sequence of effectful nodes from a region root down to the
/// region's argument.
pub type StateWalk = Vec<(ClassId, NodeId)>;

/// A mapping from the classes and nodes of one graph to another, with
/// [`UNEXTRACTABLE`] marking entities that have no image.
#[derive(Clone, Debug, PartialEq)]
pub struct EGraphMapping {
    pub class_map: Vec<ClassId>,
    pub node_map: Vec<Vec<NodeId>>,
}

impl EGraphMapping {
    /// The everywhere-undefined mapping out of `g`.
    pub fn undefined_for(g: &EGraph) -> Self {
        EGraphMapping {
            class_map: vec![UNEXTRACTABLE; g.n_classes()],
            node_map: g
                .classes
                .iter()
                .map(|c| vec![UNEXTRACTABLE; c.nodes.len()])
                .collect(),
        }
    }
}

/// Invert a `g -> gp` mapping into a `gp -> g` one. Entities of `gp` not hit
/// by the forward mapping stay unmapped.
pub fn inverse_mapping(gp: &EGraph, g2gp: &EGraphMapping) -> EGraphMapping {
    let mut gp2g = EGraphMapping::undefined_for(gp);
    for (i, &ci) in g2gp.class_map.iter().enumerate() {
        if ci != UNEXTRACTABLE {
            debug_assert!(ci < gp.n_classes());
            gp2g.class_map[ci] = i;
        }
    }
    for (i, nodes) in g2gp.node_map.iter().enumerate() {
        for (j, &nj) in nodes.iter().enumerate() {
            if nj != UNEXTRACTABLE {
                debug_assert!(nj < gp.classes[g2gp.class_map[i]].nodes.len());
                gp2g.node_map[g2gp.class_map[i]][nj] = j;
            }
        }
    }
    gp2g
}

/// Rewrite every record of `e` through `f`.
pub fn project_extraction(f: &EGraphMapping, e: &Extraction) -> Extraction {
    let mut ne = e.clone();
    for rec in &mut ne {
        rec.n = f.node_map[rec.c][rec.n];
        rec.c = f.class_map[rec.c];
    }
    ne
}

/// Reverse index: for each class, the `(class, node)` pairs that reference it
/// as a child. Sentinel children are skipped.
pub fn parents_index(g: &EGraph) -> Vec<Vec<(ClassId, NodeId)>> {
    let mut parents = vec![Vec::new(); g.n_classes()];
    for (i, class) in g.classes.iter().enumerate() {
        for (j, node) in class.nodes.iter().enumerate() {
            for &ch in &node.children {
                if ch != UNEXTRACTABLE {
                    parents[ch].push((i, j));
                }
            }
        }
    }
    parents
}

/// Per-node child counts, the starting point for saturation worklists.
pub fn child_counters(g: &EGraph) -> Vec<Vec<usize>> {
    g.classes
        .iter()
        .map(|c| c.nodes.iter().map(|n| n.children.len()).collect())
        .collect()
}

/// Remove every node whose descendants cannot be grounded in leaves, and,
/// when `root` is given, every class unreachable from it through extractable
/// nodes. Returns the pruned graph and the old-to-new mapping.
pub fn prune_unextractable(g: &EGraph, root: Option<ClassId>) -> (EGraph, EGraphMapping) {
    let mut extractable = vec![false; g.n_classes()];
    let parents = parents_index(g);
    let mut counts = child_counters(g);
    let mut queue = VecDeque::new();

    for (i, class) in g.classes.iter().enumerate() {
        for node in &class.nodes {
            if node.children.is_empty() && !extractable[i] {
                extractable[i] = true;
                queue.push_back(i);
            }
        }
    }
    while let Some(u) = queue.pop_front() {
        for &(vc, vn) in &parents[u] {
            counts[vc][vn] -= 1;
            if counts[vc][vn] == 0 && !extractable[vc] {
                extractable[vc] = true;
                queue.push_back(vc);
            }
        }
    }

    let mut reachable = vec![root.is_none(); g.n_classes()];
    if let Some(root) = root {
        reachable[root] = true;
        queue.push_back(root);
        while let Some(u) = queue.pop_front() {
            for node in &g.classes[u].nodes {
                let grounded = node
                    .children
                    .iter()
                    .all(|&v| v != UNEXTRACTABLE && extractable[v]);
                if grounded {
                    for &v in &node.children {
                        if !reachable[v] {
                            reachable[v] = true;
                            queue.push_back(v);
                        }
                    }
                }
            }
        }
    }

    let mut gp = EGraph::default();
    let mut mapping = EGraphMapping::undefined_for(g);
    for (i, class) in g.classes.iter().enumerate() {
        if reachable[i] && extractable[i] {
            mapping.class_map[i] = gp.n_classes();
            gp.classes.push(EClass {
                nodes: Vec::new(),
                effectful: class.effectful,
            });
        }
    }
    for (i, class) in g.classes.iter().enumerate() {
        if mapping.class_map[i] == UNEXTRACTABLE {
            continue;
        }
        for (j, node) in class.nodes.iter().enumerate() {
            let grounded = node
                .children
                .iter()
                .all(|&v| v != UNEXTRACTABLE && mapping.class_map[v] != UNEXTRACTABLE);
            if !grounded {
                continue;
            }
            let nc = mapping.class_map[i];
            let nn = ENode {
                head: node.head.clone(),
                class: nc,
                children: node.children.iter().map(|&v| mapping.class_map[v]).collect(),
            };
            mapping.node_map[i][j] = gp.classes[nc].nodes.len();
            gp.classes[nc].nodes.push(nn);
        }
    }
    log::debug!(
        "pruned {} -> {} classes, {} -> {} nodes",
        g.n_classes(),
        gp.n_classes(),
        g.n_nodes(),
        gp.n_nodes()
    );
    debug_assert!(crate::validate::is_wellformed_egraph(&gp, false, true));
    debug_assert!(crate::validate::is_valid_mapping(
        &mapping, g, &gp, true, true, true, true
    ));
    (gp, mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_graphs::GraphBuilder;

    #[test]
    fn prune_removes_ungrounded_nodes() {
        let mut b = GraphBuilder::new();
        let leaf = b.class(false);
        b.node(leaf, "Int", &[]);
        let ok = b.class(false);
        b.node(ok, "Add", &[leaf, leaf]);
        // A class whose only node refers to itself can never bottom out.
        let cyc = b.class(false);
        b.node(cyc, "Add", &[cyc, cyc]);
        let mixed = b.class(false);
        b.node(mixed, "Mul", &[cyc, leaf]);
        b.node(mixed, "Sub", &[ok, leaf]);
        let g = b.build();

        let (gp, m) = prune_unextractable(&g, None);
        assert_eq!(m.class_map[cyc], UNEXTRACTABLE);
        assert_ne!(m.class_map[mixed], UNEXTRACTABLE);
        // Only the grounded node of `mixed` survives.
        assert_eq!(gp[m.class_map[mixed]].nodes.len(), 1);
        assert_eq!(gp[m.class_map[mixed]].nodes[0].op(), "Sub");
    }

    #[test]
    fn prune_with_root_drops_unreachable() {
        let mut b = GraphBuilder::new();
        let leaf = b.class(false);
        b.node(leaf, "Int", &[]);
        let orphan = b.class(false);
        b.node(orphan, "Int", &[]);
        let root = b.class(false);
        b.node(root, "Add", &[leaf, leaf]);
        let g = b.build();

        let (gp, m) = prune_unextractable(&g, Some(root));
        assert_eq!(m.class_map[orphan], UNEXTRACTABLE);
        assert_eq!(gp.n_classes(), 2);
    }

    #[test]
    fn inverse_mapping_is_an_involution() {
        let mut b = GraphBuilder::new();
        let leaf = b.class(false);
        b.node(leaf, "Int", &[]);
        let cyc = b.class(false);
        b.node(cyc, "Add", &[cyc, cyc]);
        let root = b.class(false);
        b.node(root, "Add", &[leaf, leaf]);
        b.node(root, "Mul", &[cyc, cyc]);
        let g = b.build();

        let (gp, m) = prune_unextractable(&g, Some(root));
        let inv = inverse_mapping(&gp, &m);
        // Inverting twice lands back on the original (partial) mapping.
        let inv_inv = inverse_mapping(&g, &inv);
        assert_eq!(inv_inv, m);
    }

    #[test]
    fn project_roundtrips_through_inverse() {
        let mut b = GraphBuilder::new();
        let leaf = b.class(false);
        b.node(leaf, "Int", &[]);
        let cyc = b.class(false);
        b.node(cyc, "Add", &[cyc, cyc]);
        let root = b.class(false);
        b.node(root, "Add", &[leaf, leaf]);
        let g = b.build();

        let (gp, m) = prune_unextractable(&g, Some(root));
        let e = vec![
            ExtractionNode {
                c: m.class_map[leaf],
                n: 0,
                children: vec![],
            },
            ExtractionNode {
                c: m.class_map[root],
                n: 0,
                children: vec![0, 0],
            },
        ];
        let inv = inverse_mapping(&gp, &m);
        let up = project_extraction(&inv, &e);
        assert_eq!(up[1].c, root);
        let back = project_extraction(&m, &up);
        assert_eq!(back, e);
    }
}
