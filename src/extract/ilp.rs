//! ILP formulation of region extraction, solved by an external MIP solver.
//!
//! The encoding has one binary pick variable per node, one binary choice
//! variable per (node, child slot, candidate child node), and one order
//! variable per node for big-M acyclicity. The solver runs as a child
//! process over an LP file so a crashing or licensed solver never takes the
//! extractor down and Gurobi/CBC stay interchangeable.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tempfile::NamedTempFile;

use crate::config::{Config, IlpSolver};
use crate::cost::{enode_cost, Cost};
use crate::egraph::{ClassId, EGraph, Extraction, ExtractionId, ExtractionNode, NodeId, UNEXTRACTABLE};
use crate::extract::walk_rebuild::extract_with_walk;
use crate::region::find_arg;
use crate::validate;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub enum IlpOutcome {
    Extraction(Extraction),
    TimedOut,
    Infeasible,
    /// The solver failed in a way that is neither a timeout nor reported
    /// infeasibility; details already went to stderr.
    Failed,
}

#[derive(Default)]
pub struct IlpStats {
    pub num_vars: usize,
}

struct ChoiceVar {
    name: String,
    parent_class: ClassId,
    parent_node: NodeId,
    child_class: ClassId,
    child_node: NodeId,
}

impl ChoiceVar {
    fn is_self_edge(&self) -> bool {
        self.parent_class == self.child_class && self.parent_node == self.child_node
    }
}

struct IlpEncoding {
    lp: String,
    pick: Vec<Vec<String>>,
    choices: Vec<ChoiceVar>,
    /// `[c][n][k]`: choice variable ids for child slot `k` of node `(c,n)`.
    choice_index: Vec<Vec<Vec<Vec<usize>>>>,
    num_vars: usize,
}

/// Emit the LP problem. `pick_cost` carries the state-walk cost for
/// effectful nodes and the plain operator cost for pure ones; a zero
/// objective drops costs entirely (feasibility-only mode).
fn encode(g: &EGraph, root: ClassId, pick_cost: &[Vec<Cost>], minimize: bool) -> IlpEncoding {
    let total_enodes = g.n_nodes();
    let max_order = total_enodes.max(1);

    let mut pick = Vec::with_capacity(g.n_classes());
    let mut order = Vec::with_capacity(g.n_classes());
    for (c, class) in g.classes.iter().enumerate() {
        pick.push(
            (0..class.nodes.len())
                .map(|n| format!("p_{}_{}", c, n))
                .collect::<Vec<_>>(),
        );
        order.push(
            (0..class.nodes.len())
                .map(|n| format!("o_{}_{}", c, n))
                .collect::<Vec<_>>(),
        );
    }

    let mut choices: Vec<ChoiceVar> = Vec::new();
    let mut choice_index: Vec<Vec<Vec<Vec<usize>>>> = Vec::with_capacity(g.n_classes());
    // Choice variables targeting each effectful node from an effectful
    // parent, for the linearity constraint.
    let mut effect_incoming: Vec<Vec<Vec<usize>>> = g
        .classes
        .iter()
        .map(|c| vec![Vec::new(); c.nodes.len()])
        .collect();
    for (c, class) in g.classes.iter().enumerate() {
        let mut per_node = Vec::with_capacity(class.nodes.len());
        for (n, node) in class.nodes.iter().enumerate() {
            let mut per_slot = Vec::with_capacity(node.children.len());
            for (k, &child_class) in node.children.iter().enumerate() {
                if child_class == UNEXTRACTABLE || child_class >= g.n_classes() {
                    eprintln!("Error: ILP encoding saw an out-of-bounds child eclass");
                    std::process::exit(1);
                }
                if g[child_class].nodes.is_empty() {
                    eprintln!("Error: ILP encoding saw a child eclass with no enodes");
                    std::process::exit(1);
                }
                let mut slot = Vec::with_capacity(g[child_class].nodes.len());
                for m in 0..g[child_class].nodes.len() {
                    let idx = choices.len();
                    choices.push(ChoiceVar {
                        name: format!("s_{}_{}_{}_{}", c, n, k, m),
                        parent_class: c,
                        parent_node: n,
                        child_class,
                        child_node: m,
                    });
                    slot.push(idx);
                    if class.effectful && g[child_class].effectful {
                        effect_incoming[child_class][m].push(idx);
                    }
                }
                per_slot.push(slot);
            }
            per_node.push(per_slot);
        }
        choice_index.push(per_node);
    }

    let mut lp = String::new();
    lp.push_str("Minimize\n obj:");
    let mut wrote_term = false;
    if minimize {
        for (c, class) in g.classes.iter().enumerate() {
            for n in 0..class.nodes.len() {
                let cost = pick_cost[c][n];
                let _ = write!(lp, " {}{} {}", if wrote_term { "+ " } else { "" }, cost, pick[c][n]);
                wrote_term = true;
            }
        }
    }
    if !wrote_term {
        lp.push_str(" 0");
    }
    lp.push_str("\nSubject To\n");

    // At least one node of the root class is picked.
    {
        let _ = write!(lp, " pick_root:");
        for (n, name) in pick[root].iter().enumerate() {
            let _ = write!(lp, "{} {}", if n == 0 { "" } else { " +" }, name);
        }
        lp.push_str(" >= 1\n");
    }

    // A picked node resolves every child slot.
    for (c, class) in g.classes.iter().enumerate() {
        for (n, _) in class.nodes.iter().enumerate() {
            for (k, slot) in choice_index[c][n].iter().enumerate() {
                let _ = write!(lp, " child_select_{}_{}_{}:", c, n, k);
                for (i, &idx) in slot.iter().enumerate() {
                    let _ = write!(lp, "{} {}", if i == 0 { "" } else { " +" }, choices[idx].name);
                }
                let _ = writeln!(lp, " - {} >= 0", pick[c][n]);
            }
        }
    }

    // Choosing an edge picks the node it points to.
    for (idx, cv) in choices.iter().enumerate() {
        let _ = writeln!(
            lp,
            " child_link_{}: {} - {} <= 0",
            idx, cv.name, pick[cv.child_class][cv.child_node]
        );
    }

    // Linearity: an effectful node is handed the state by at most one
    // effectful parent edge.
    for (c, class) in g.classes.iter().enumerate() {
        if !class.effectful {
            continue;
        }
        for (n, incoming) in effect_incoming[c].iter().enumerate() {
            if incoming.is_empty() {
                continue;
            }
            let _ = write!(lp, " state_unique_{}_{}:", c, n);
            for (i, &idx) in incoming.iter().enumerate() {
                let _ = write!(lp, "{} {}", if i == 0 { "" } else { " +" }, choices[idx].name);
            }
            lp.push_str(" <= 1\n");
        }
    }

    // Order decreases along chosen edges (big-M); self-edges are forbidden
    // outright.
    for (idx, cv) in choices.iter().enumerate() {
        if cv.is_self_edge() {
            let _ = writeln!(lp, " order_edge_{}: {} <= 0", idx, cv.name);
        } else {
            let _ = writeln!(
                lp,
                " order_edge_{}: {} - {} + {} {} <= {}",
                idx,
                order[cv.child_class][cv.child_node],
                order[cv.parent_class][cv.parent_node],
                max_order,
                cv.name,
                max_order - 1
            );
        }
    }

    lp.push_str("Bounds\n");
    for class_order in &order {
        for name in class_order {
            let _ = writeln!(lp, " 0 <= {} <= {}", name, max_order - 1);
        }
    }

    lp.push_str("Binary\n");
    for class_pick in &pick {
        for name in class_pick {
            let _ = writeln!(lp, " {}", name);
        }
    }
    for cv in &choices {
        let _ = writeln!(lp, " {}", cv.name);
    }
    lp.push_str("End\n");

    let num_vars = 2 * total_enodes + choices.len();
    IlpEncoding {
        lp,
        pick,
        choices,
        choice_index,
        num_vars,
    }
}

/// Tolerant solution parser: accepts `name value` and `idx name value`
/// layouts, skips anything else, and recognises textual infeasibility.
fn parse_solution(text: &str) -> (FxHashMap<String, f64>, bool) {
    let mut values = FxHashMap::default();
    for line in text.lines() {
        if line.contains("Infeasible") || line.contains("infeasible") {
            return (values, true);
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() >= 2 && tokens[0].chars().next().is_some_and(|c| c.is_alphabetic()) {
            if let Ok(v) = tokens[1].parse::<f64>() {
                values.insert(tokens[0].to_string(), v);
            }
        } else if tokens.len() >= 3 {
            if let Ok(v) = tokens[2].parse::<f64>() {
                values.insert(tokens[1].to_string(), v);
            }
        }
    }
    (values, false)
}

fn var(values: &FxHashMap<String, f64>, name: &str) -> f64 {
    values.get(name).copied().unwrap_or(0.0)
}

/// Rebuild an extraction from the binary assignment. Returns `None` (after
/// printing the reason) when the assignment is not a usable extraction,
/// which indicates a solver error.
fn rebuild(
    g: &EGraph,
    root: ClassId,
    values: &FxHashMap<String, f64>,
    enc: &IlpEncoding,
) -> Option<Extraction> {
    let picked: Vec<Vec<bool>> = g
        .classes
        .iter()
        .enumerate()
        .map(|(c, class)| {
            (0..class.nodes.len())
                .map(|n| var(values, &enc.pick[c][n]) > 0.5)
                .collect()
        })
        .collect();

    // A solution file that never mentions the root is not a solution.
    let saw_root = enc.pick[root].iter().any(|name| values.contains_key(name));
    if !saw_root {
        eprintln!("Error: solution file did not contain root variable assignments");
        return None;
    }
    let root_nodes: Vec<NodeId> = (0..g[root].nodes.len()).filter(|&n| picked[root][n]).collect();
    if root_nodes.is_empty() {
        eprintln!("Error: no root enode selected");
        return None;
    }

    // Resolve each slot to the lowest set choice; solvers occasionally
    // round more than one on.
    let mut selection: Vec<Vec<Vec<NodeId>>> = g
        .classes
        .iter()
        .map(|class| {
            class
                .nodes
                .iter()
                .map(|node| vec![UNEXTRACTABLE; node.children.len()])
                .collect()
        })
        .collect();
    for (c, class) in g.classes.iter().enumerate() {
        for n in 0..class.nodes.len() {
            for (k, slot) in enc.choice_index[c][n].iter().enumerate() {
                for &idx in slot {
                    if var(values, &enc.choices[idx].name) > 0.5 {
                        selection[c][n][k] = enc.choices[idx].child_node;
                        break;
                    }
                }
            }
        }
    }

    // Unpicked nodes cannot contribute edges.
    for (c, class) in g.classes.iter().enumerate() {
        for (n, node) in class.nodes.iter().enumerate() {
            if !picked[c][n] {
                continue;
            }
            for (k, &sel) in selection[c][n].iter().enumerate() {
                if sel == UNEXTRACTABLE {
                    eprintln!(
                        "Error: missing child selection for picked enode {},{} slot {}",
                        c, n, k
                    );
                    return None;
                }
                let child_class = node.children[k];
                if !picked[child_class][sel] {
                    eprintln!("Error: child enode not marked as picked");
                    return None;
                }
            }
        }
    }
    struct Builder<'a> {
        g: &'a EGraph,
        selection: &'a [Vec<Vec<NodeId>>],
        extraction: Extraction,
        index: FxHashMap<(ClassId, NodeId), ExtractionId>,
        visiting: Vec<(ClassId, NodeId)>,
    }

    impl Builder<'_> {
        fn build(&mut self, c: ClassId, n: NodeId) -> Option<ExtractionId> {
            if let Some(&at) = self.index.get(&(c, n)) {
                return Some(at);
            }
            if self.visiting.contains(&(c, n)) {
                eprintln!("Error: cycle detected when building extraction");
                return None;
            }
            self.visiting.push((c, n));
            let mut children = Vec::with_capacity(self.g.node(c, n).children.len());
            for k in 0..self.g.node(c, n).children.len() {
                let child_class = self.g.node(c, n).children[k];
                let child_node = self.selection[c][n][k];
                if child_node == UNEXTRACTABLE {
                    eprintln!("Error: missing child during extraction reconstruction");
                    return None;
                }
                children.push(self.build(child_class, child_node)?);
            }
            self.visiting.pop();
            let at = self.extraction.len();
            self.extraction.push(ExtractionNode { c, n, children });
            self.index.insert((c, n), at);
            Some(at)
        }
    }

    let mut builder = Builder {
        g,
        selection: &selection,
        extraction: Extraction::new(),
        index: FxHashMap::default(),
        visiting: Vec::new(),
    };
    for &n in &root_nodes {
        builder.build(root, n)?;
    }
    let extraction = builder.extraction;
    if extraction.is_empty() || !validate::is_valid_extraction(g, root, &extraction) {
        eprintln!("Error: constructed extraction is invalid");
        return None;
    }
    Some(extraction)
}

fn solver_command(config: &Config, lp: &std::path::Path, sol: &std::path::Path) -> Command {
    let timeout = config.ilp_timeout().as_secs();
    match config.ilp_solver {
        IlpSolver::Cbc => {
            let mut cmd = Command::new("cbc");
            cmd.arg(lp)
                .arg("seconds")
                .arg(timeout.to_string())
                .arg("threads")
                .arg("1")
                .arg("solve")
                .arg("branch")
                .arg("solu")
                .arg(sol);
            cmd
        }
        IlpSolver::Gurobi => {
            let mut cmd = Command::new("gurobi_cl");
            cmd.arg("Threads=1")
                .arg(format!("TimeLimit={}", timeout))
                .arg(format!("ResultFile={}", sol.display()))
                .arg(lp);
            cmd
        }
    }
}

/// Run the solver in its own process group, polling every 50 ms. On timeout
/// the whole group is killed; MIP solvers like to fork helpers.
fn run_solver(mut cmd: Command, log: &NamedTempFile, timeout: Duration) -> Option<bool> {
    let out = match log.as_file().try_clone() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: failed to clone solver log handle: {}", e);
            return Some(false);
        }
    };
    let err = match log.as_file().try_clone() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: failed to clone solver log handle: {}", e);
            return Some(false);
        }
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .process_group(0);
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to spawn MIP solver: {}", e);
            return Some(false);
        }
    };
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status.success()),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: failed to poll MIP solver: {}", e);
                return Some(false);
            }
        }
        if start.elapsed() >= timeout {
            // No graceful shutdown: the process group gets SIGKILL and is
            // reaped.
            unsafe {
                libc::kill(-(child.id() as i32), libc::SIGKILL);
            }
            let _ = child.wait();
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Extract one regionalised graph through the external solver.
pub fn extract_region_ilp(
    g: &EGraph,
    root: ClassId,
    statewalk_cost: &[Vec<Cost>],
    config: &Config,
) -> (IlpOutcome, IlpStats) {
    let (argc, argn) = find_arg(g);
    if root == argc {
        // Single-class region; no solver needed.
        let e = extract_with_walk(g, root, &vec![(root, argn)]);
        return (IlpOutcome::Extraction(e), IlpStats::default());
    }

    let pick_cost: Vec<Vec<Cost>> = g
        .classes
        .iter()
        .enumerate()
        .map(|(c, class)| {
            class
                .nodes
                .iter()
                .enumerate()
                .map(|(n, node)| {
                    if class.effectful {
                        statewalk_cost[c][n]
                    } else {
                        enode_cost(node)
                    }
                })
                .collect()
        })
        .collect();
    let enc = encode(g, root, &pick_cost, config.ilp_minimize);
    let stats = IlpStats { num_vars: enc.num_vars };

    let lp_file = match tempfile::Builder::new()
        .prefix("extract_region")
        .suffix(".lp")
        .tempfile()
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: failed to create LP temp file: {}", e);
            return (IlpOutcome::Failed, stats);
        }
    };
    let sol_file = match tempfile::Builder::new()
        .prefix("extract_region")
        .suffix(".sol")
        .tempfile()
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: failed to create solution temp file: {}", e);
            return (IlpOutcome::Failed, stats);
        }
    };
    let log_file = match tempfile::Builder::new()
        .prefix("extract_region")
        .suffix(".log")
        .tempfile()
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: failed to create log temp file: {}", e);
            return (IlpOutcome::Failed, stats);
        }
    };
    if let Err(e) = fs::write(lp_file.path(), &enc.lp) {
        eprintln!("Error: failed to write LP file: {}", e);
        return (IlpOutcome::Failed, stats);
    }

    let cmd = solver_command(config, lp_file.path(), sol_file.path());
    let finished = run_solver(cmd, &log_file, config.ilp_timeout());

    let solver_log = fs::read_to_string(log_file.path()).unwrap_or_default();

    match finished {
        None => {
            log::info!("ILP solver timed out for region root {}", root);
            return (IlpOutcome::TimedOut, stats);
        }
        Some(false) => {
            eprintln!("solver log output:\n{}", solver_log);
            eprintln!("Error: MIP solver invocation failed");
            return (IlpOutcome::Failed, stats);
        }
        Some(true) => {}
    }
    if solver_log.contains("ERROR") || solver_log.contains("Error") {
        eprintln!("solver log output:\n{}", solver_log);
        eprintln!("Error: MIP solver reported an error while solving");
        return (IlpOutcome::Failed, stats);
    }

    let sol_text = match fs::read_to_string(sol_file.path()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: failed to read solution file: {}", e);
            return (IlpOutcome::Failed, stats);
        }
    };
    if sol_text.trim().is_empty() {
        // An empty solution with a textual infeasibility verdict in the log
        // is conclusive; otherwise the solver just failed.
        if solver_log.contains("Infeasible") || solver_log.contains("infeasible") {
            return (IlpOutcome::Infeasible, stats);
        }
        eprintln!("solver log output:\n{}", solver_log);
        eprintln!("Error: MIP solver produced an empty solution file");
        return (IlpOutcome::Failed, stats);
    }

    let (values, infeasible) = parse_solution(&sol_text);
    if infeasible {
        return (IlpOutcome::Infeasible, stats);
    }
    match rebuild(g, root, &values, &enc) {
        Some(e) => (IlpOutcome::Extraction(e), stats),
        None => (IlpOutcome::Failed, stats),
    }
}
