//! Ingestion of the upstream equality-saturation export.
//!
//! The JSON carries one entry per e-node (`op`, `children` by node name,
//! `eclass`, plus `cost`/`subsumed` which we ignore) and no effectful bit;
//! effectfulness is inferred from the type assertions in the graph itself:
//! types reachable from `StateT` are stateful, and expressions `HasType`-d
//! to a stateful type thread the state.
//!
//! Only expression classes reachable from a function root survive, plus the
//! type classes `Function` and `Alloc` nodes need (restricted to their
//! normal-form constructors). Analysis operators the rewriter cannot
//! reconstruct are filtered through a closed allow-list.

use std::collections::VecDeque;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::cost::is_type_constructor;
use crate::egraph::{prune_unextractable, ClassId, EClass, EGraph, ENode, HEAD_DELIM, UNEXTRACTABLE};

struct RawNode {
    name: String,
    op: String,
    children: Vec<String>,
}

struct RawEGraph {
    /// Class name per class id, in first-seen order.
    class_names: Vec<String>,
    classes: Vec<Vec<RawNode>>,
    /// Node name -> (class, node index).
    node_ids: FxHashMap<String, (ClassId, usize)>,
}

impl RawEGraph {
    fn is_expr(&self, i: ClassId) -> bool {
        let name = &self.class_names[i];
        ["Expr", "Constant", "TernaryOp", "BinaryOp", "UnaryOp"]
            .iter()
            .any(|p| name.starts_with(p))
    }

    fn is_type(&self, i: ClassId) -> bool {
        let name = &self.class_names[i];
        ["Type", "BaseType", "TypeList"].iter().any(|p| name.starts_with(p))
    }

    fn is_primitive_node(&self, i: ClassId, j: usize) -> bool {
        let name = &self.classes[i][j].name;
        name.len() > 9 && name.starts_with("primitive")
    }

    fn is_primitive_class(&self, i: ClassId) -> bool {
        (0..self.classes[i].len()).any(|j| self.is_primitive_node(i, j))
    }

    fn child_class(&self, name: &str) -> Option<ClassId> {
        self.node_ids.get(name).map(|&(c, _)| c)
    }
}

const EXTRACTABLE_OPS: &[&str] = &[
    "Int", "Bool", "Float",
    // Leaves
    "Const", "Arg",
    // Primitive booleans and unit
    "true", "false", "()",
    // Lists
    "Empty", "Single", "Concat", "Nil", "Cons", "Get",
    // Algebra
    "Abs", "Bitand", "Neg", "Add", "PtrAdd", "Sub", "And", "Or", "Not", "Shl", "Shr", "FAdd",
    "FSub", "Fmax", "Fmin", "Mul", "FMul", "Div", "FDiv",
    // Comparisons
    "Eq", "LessThan", "GreaterThan", "LessEq", "GreaterEq", "Select", "Smax", "Smin", "FEq",
    "FLessThan", "FGreaterThan", "FLessEq", "FGreaterEq",
    // Effects
    "Print", "Write", "Load", "Alloc", "Free", "Call",
    // Control
    "Program", "Function", "DoWhile", "If", "Switch",
    // Schema
    "Bop", "Uop", "Top",
];

fn is_extractable_op(op: &str) -> bool {
    // Primitive literals: strings, floats, negative and plain numbers.
    if op.starts_with(['"', '\\', '.', '-']) || op.starts_with(|c: char| c.is_ascii_digit()) {
        return true;
    }
    EXTRACTABLE_OPS.contains(&op)
}

fn read_raw(input: &str) -> Result<RawEGraph> {
    // The exporter occasionally prepends commentary; drop line-level noise
    // before handing the rest to the JSON parser.
    let cleaned: String = input
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let doc: Value = serde_json::from_str(&cleaned).context("failed to parse input JSON")?;
    let nodes = doc
        .get("nodes")
        .and_then(Value::as_object)
        .context("input JSON has no \"nodes\" object")?;

    let mut class_ids = IndexMap::<String, ClassId>::new();
    let mut raw = RawEGraph {
        class_names: Vec::new(),
        classes: Vec::new(),
        node_ids: FxHashMap::default(),
    };
    for (name, body) in nodes {
        let Some(op) = body.get("op").and_then(Value::as_str) else {
            log::warn!("node {} has no op, skipping", name);
            continue;
        };
        let Some(eclass) = body.get("eclass").and_then(Value::as_str) else {
            log::warn!("node {} has no eclass, skipping", name);
            continue;
        };
        let children: Vec<String> = body
            .get("children")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        // `cost` and `subsumed` are present in the export but irrelevant
        // here; subsumption is already resolved upstream.
        let entry = class_ids.entry(eclass.to_string());
        let class = *entry.or_insert_with(|| {
            raw.class_names.push(eclass.to_string());
            raw.classes.push(Vec::new());
            raw.classes.len() - 1
        });
        raw.node_ids
            .insert(name.clone(), (class, raw.classes[class].len()));
        raw.classes[class].push(RawNode {
            name: name.clone(),
            op: op.to_string(),
            children,
        });
    }
    if raw.classes.is_empty() {
        bail!("input JSON contains no nodes");
    }
    Ok(raw)
}

/// Types reachable from the `StateT` constructor thread the state.
fn propagate_effectful_types(raw: &RawEGraph) -> Vec<bool> {
    let n = raw.classes.len();
    let mut edges: Vec<Vec<ClassId>> = vec![Vec::new(); n];
    let mut state_t = None;
    for i in 0..n {
        if raw.is_type(i) {
            for node in &raw.classes[i] {
                // Index projections merge with a grounded type eventually;
                // following them would make every tuple stateful.
                if node.op == "TypeList-ith" || node.op == "TypeListRemoveAt" {
                    continue;
                }
                if node.op == "StateT" {
                    state_t = Some(i);
                }
                for ch in &node.children {
                    if let Some(v) = raw.child_class(ch) {
                        debug_assert!(raw.is_type(v));
                        edges[v].push(i);
                    }
                }
            }
        }
    }
    let mut effectful = vec![false; n];
    let Some(state_t) = state_t else {
        return effectful;
    };
    let mut queue = VecDeque::new();
    effectful[state_t] = true;
    queue.push_back(state_t);
    while let Some(u) = queue.pop_front() {
        for &v in &edges[u] {
            if !effectful[v] {
                effectful[v] = true;
                queue.push_back(v);
            }
        }
    }
    effectful
}

/// Expressions asserted to have a stateful type, plus every `Function`.
fn mark_effectful_exprs(raw: &RawEGraph, effectful_type: &[bool]) -> Vec<bool> {
    let mut effectful = vec![false; raw.classes.len()];
    for (i, class) in raw.classes.iter().enumerate() {
        for node in class {
            if node.op == "HasType" && node.children.len() == 2 {
                let (Some(ec), Some(tc)) = (
                    raw.child_class(&node.children[0]),
                    raw.child_class(&node.children[1]),
                ) else {
                    continue;
                };
                debug_assert!(raw.is_expr(ec));
                debug_assert!(raw.is_type(tc));
                if effectful_type[tc] {
                    effectful[ec] = true;
                }
            }
            if node.op == "Function" {
                effectful[i] = true;
            }
        }
    }
    effectful
}

fn find_function_roots(raw: &RawEGraph) -> Vec<ClassId> {
    let mut roots = Vec::new();
    for (i, class) in raw.classes.iter().enumerate() {
        if class.iter().any(|n| n.op == "Function") {
            roots.push(i);
        }
    }
    roots
}

/// BFS from a function root over expression and primitive classes, also
/// collecting the type classes that `Function` and `Alloc` nodes must keep.
fn mark_reachable(
    raw: &RawEGraph,
    root: ClassId,
    reachable: &mut [bool],
    necessary_types: &mut [bool],
) {
    if reachable[root] {
        return;
    }
    let mut queue = VecDeque::new();
    let mut type_queue = VecDeque::new();
    reachable[root] = true;
    queue.push_back(root);
    while let Some(u) = queue.pop_front() {
        if raw.is_primitive_class(u) {
            continue;
        }
        for node in &raw.classes[u] {
            for ch in &node.children {
                let Some(v) = raw.child_class(ch) else { continue };
                if !reachable[v] && (raw.is_expr(v) || raw.is_primitive_class(v)) {
                    reachable[v] = true;
                    queue.push_back(v);
                }
            }
            let keep_types: &[usize] = match node.op.as_str() {
                "Function" if node.children.len() == 4 => &[1, 2],
                "Alloc" if node.children.len() == 4 => &[3],
                _ => &[],
            };
            for &k in keep_types {
                let Some(t) = raw.child_class(&node.children[k]) else { continue };
                debug_assert!(raw.is_type(t));
                if !necessary_types[t] {
                    necessary_types[t] = true;
                    type_queue.push_back(t);
                }
            }
        }
    }
    while let Some(u) = type_queue.pop_front() {
        debug_assert!(raw.is_type(u));
        for node in &raw.classes[u] {
            if !is_type_constructor(&node.op) {
                continue;
            }
            for ch in &node.children {
                let Some(v) = raw.child_class(ch) else { continue };
                if !necessary_types[v] {
                    necessary_types[v] = true;
                    type_queue.push_back(v);
                }
            }
        }
    }
}

fn build_egraph(
    raw: &RawEGraph,
    reachable: &[bool],
    necessary_types: &[bool],
    effectful_expr: &[bool],
) -> (EGraph, FxHashMap<ClassId, ClassId>) {
    let mut g = EGraph::default();
    let mut class_map = FxHashMap::<ClassId, ClassId>::default();
    for i in 0..raw.classes.len() {
        if reachable[i] && (raw.is_expr(i) || raw.is_primitive_class(i)) {
            class_map.insert(i, g.n_classes());
            g.classes.push(EClass {
                nodes: Vec::new(),
                effectful: effectful_expr[i],
            });
        }
        if necessary_types[i] {
            class_map.insert(i, g.n_classes());
            g.classes.push(EClass {
                nodes: Vec::new(),
                effectful: false,
            });
        }
        debug_assert!(!(reachable[i] && necessary_types[i]));
    }
    for (i, class) in raw.classes.iter().enumerate() {
        if reachable[i] {
            if raw.is_expr(i) {
                let nid = class_map[&i];
                for node in class {
                    if !is_extractable_op(&node.op) {
                        continue;
                    }
                    let children = node
                        .children
                        .iter()
                        .filter_map(|ch| {
                            let v = raw.child_class(ch)?;
                            let mapped = *class_map.get(&v)?;
                            // Type operands are dropped except where the
                            // printer needs them again.
                            if raw.is_type(v) && node.op != "Function" && node.op != "Alloc" {
                                return None;
                            }
                            Some(mapped)
                        })
                        .collect();
                    g.classes[nid].nodes.push(ENode {
                        head: format!("{}{}{}", node.name, HEAD_DELIM, node.op),
                        class: nid,
                        children,
                    });
                }
            } else {
                for (j, node) in class.iter().enumerate() {
                    if !raw.is_primitive_node(i, j) || !is_extractable_op(&node.op) {
                        continue;
                    }
                    let nid = class_map[&i];
                    let children = node
                        .children
                        .iter()
                        .filter_map(|ch| {
                            let v = raw.child_class(ch)?;
                            if raw.is_type(v) {
                                return None;
                            }
                            class_map.get(&v).copied()
                        })
                        .collect();
                    g.classes[nid].nodes.push(ENode {
                        head: format!("{}{}{}", node.name, HEAD_DELIM, node.op),
                        class: nid,
                        children,
                    });
                }
            }
        }
        if necessary_types[i] {
            let nid = class_map[&i];
            for node in class {
                if !is_type_constructor(&node.op) {
                    continue;
                }
                let children = node
                    .children
                    .iter()
                    .map(|ch| {
                        let v = raw.child_class(ch).expect("dangling type child");
                        class_map[&v]
                    })
                    .collect();
                g.classes[nid].nodes.push(ENode {
                    head: format!("{}{}{}", node.name, HEAD_DELIM, node.op),
                    class: nid,
                    children,
                });
            }
            debug_assert_eq!(g.classes[nid].nodes.len(), 1);
        }
    }
    (g, class_map)
}

/// Parse the exporter JSON into a pruned e-graph plus its function roots.
pub fn parse_egraph(input: &str) -> Result<(EGraph, Vec<ClassId>)> {
    let raw = read_raw(input)?;
    let effectful_type = propagate_effectful_types(&raw);
    let effectful_expr = mark_effectful_exprs(&raw, &effectful_type);
    let roots = find_function_roots(&raw);
    if roots.is_empty() {
        bail!("input contains no Function nodes");
    }

    let mut reachable = vec![false; raw.classes.len()];
    let mut necessary_types = vec![false; raw.classes.len()];
    for &root in &roots {
        mark_reachable(&raw, root, &mut reachable, &mut necessary_types);
    }

    let (g, class_map) = build_egraph(&raw, &reachable, &necessary_types, &effectful_expr);
    debug_assert!(crate::validate::is_wellformed_egraph(&g, true, true));
    log::info!(
        "ingested {} eclasses, {} enodes, {} function roots",
        g.n_classes(),
        g.n_nodes(),
        roots.len()
    );

    let (pruned, mapping) = prune_unextractable(&g, None);
    let mut new_roots = Vec::with_capacity(roots.len());
    for root in roots {
        let mapped = mapping.class_map[class_map[&root]];
        if mapped == UNEXTRACTABLE {
            bail!("function root {} became unextractable during pruning", root);
        }
        new_roots.push(mapped);
    }
    Ok((pruned, new_roots))
}

#[cfg(test)]
mod tests {
    use super::*;

    // One function over a stateful argument: the body prints a pure Add
    // fringe, and HasType assertions carry the effect information.
    const SAMPLE: &str = r#"
    # exporter banner noise
    {
      "nodes": {
        "f0": {"op": "Function", "children": ["primitive-name0", "ty_in", "ty_out", "body0"], "eclass": "Expr-10", "cost": 1.0, "subsumed": false},
        "primitive-name0": {"op": "\"main\"", "children": [], "eclass": "String-0", "cost": 0, "subsumed": false},
        "body0": {"op": "Print", "children": ["arg0", "inc0"], "eclass": "Expr-11", "cost": 1.0, "subsumed": false},
        "arg0": {"op": "Arg", "children": ["ty_in", "assum0"], "eclass": "Expr-12", "cost": 0, "subsumed": false},
        "assum0": {"op": "DumC", "children": [], "eclass": "Assumption-0", "cost": 0, "subsumed": false},
        "inc0": {"op": "Add", "children": ["num0", "num0"], "eclass": "Expr-13", "cost": 1, "subsumed": false},
        "num0": {"op": "Const", "children": ["lit0"], "eclass": "Expr-14", "cost": 0, "subsumed": false},
        "lit0": {"op": "7", "children": [], "eclass": "Constant-0", "cost": 0, "subsumed": false},
        "primitive-lit7": {"op": "7", "children": [], "eclass": "Constant-0", "cost": 0, "subsumed": false},
        "ht0": {"op": "HasType", "children": ["body0", "ty_state"], "eclass": "Expr-ht", "cost": 0, "subsumed": false},
        "ht1": {"op": "HasType", "children": ["arg0", "ty_state"], "eclass": "Expr-ht", "cost": 0, "subsumed": false},
        "ht2": {"op": "HasType", "children": ["inc0", "ty_int"], "eclass": "Expr-ht", "cost": 0, "subsumed": false},
        "ty_state": {"op": "Base", "children": ["statet0"], "eclass": "Type-1", "cost": 0, "subsumed": false},
        "statet0": {"op": "StateT", "children": [], "eclass": "BaseType-1", "cost": 0, "subsumed": false},
        "ty_int": {"op": "Base", "children": ["intt0"], "eclass": "Type-2", "cost": 0, "subsumed": false},
        "intt0": {"op": "IntT", "children": [], "eclass": "BaseType-2", "cost": 0, "subsumed": false},
        "ty_in": {"op": "Base", "children": ["statet0"], "eclass": "Type-3", "cost": 0, "subsumed": false},
        "ty_out": {"op": "Base", "children": ["intt0"], "eclass": "Type-4", "cost": 0, "subsumed": false}
      }
    }
    "#;

    #[test]
    fn sample_parses_with_inferred_effects() {
        let (g, roots) = parse_egraph(SAMPLE).unwrap();
        assert_eq!(roots.len(), 1);
        let root = roots[0];
        assert!(g[root].effectful);
        // Function, Print body, Arg effectful; Add fringe pure.
        let effectful = g.classes.iter().filter(|c| c.effectful).count();
        assert_eq!(effectful, 3);
        // The HasType analysis nodes must not survive ingestion.
        assert!(g
            .classes
            .iter()
            .flat_map(|c| &c.nodes)
            .all(|n| n.op() != "HasType"));
        // Function keeps its type operands; their constructors survive.
        assert!(g
            .classes
            .iter()
            .flat_map(|c| &c.nodes)
            .any(|n| n.op() == "StateT"));
    }

    #[test]
    fn primitive_nodes_keep_their_literal_ops() {
        let (g, _) = parse_egraph(SAMPLE).unwrap();
        let lit = g
            .classes
            .iter()
            .flat_map(|c| &c.nodes)
            .find(|n| n.name().starts_with("primitive"))
            .unwrap();
        assert_eq!(lit.op(), "7");
    }

    #[test]
    fn rejects_rootless_input() {
        let doc = r#"{"nodes": {"a": {"op": "Add", "children": [], "eclass": "Expr-1", "cost": 1, "subsumed": false}}}"#;
        assert!(parse_egraph(doc).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_egraph("not json at all").is_err());
    }
}
