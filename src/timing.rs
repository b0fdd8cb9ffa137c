//! The `--time-ilp` harness: run every region through all four DP
//! configurations and one ILP invocation, and write a JSON report.
//!
//! Regions are prepared serially, then dispensed to a small worker pool;
//! each worker owns its pre-allocated row, so no synchronisation beyond the
//! dispatch itself is needed. The harness never feeds results back into
//! extraction, which is why the regions may finish in any order.

use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde_json::json;

use crate::config::Config;
use crate::cost::{self, Cost};
use crate::egraph::{ClassId, EGraph};
use crate::extract::ilp::{extract_region_ilp, IlpOutcome};
use crate::extract::statewalk_dp::statewalk_dp;
use crate::extract::walk_rebuild::extract_region_statewalk;
use crate::region::{construct_region, find_region_roots, Region};

/// (use_liveness, use_satellite, report key infix) per engine variant.
const VARIANTS: [(bool, bool, &str); 4] = [
    (true, true, "liveon_saton"),
    (true, false, "liveon_satoff"),
    (false, true, "liveoff_saton"),
    (false, false, "liveoff_satoff"),
];

struct RegionTimingRow {
    egraph_size: usize,
    tiger_ns: [u64; 4],
    width_max: [usize; 4],
    width_avg: [f64; 4],
    ilp_ns: Option<u64>,
    ilp_timed_out: bool,
    ilp_infeasible: bool,
    ilp_num_vars: usize,
}

fn time_region(region: &Region, projected_cost: &[Vec<Cost>], config: &Config) -> RegionTimingRow {
    let g = &region.graph;
    let mut tiger_ns = [0u64; 4];
    let mut width_max = [0usize; 4];
    let mut width_avg = [0.0f64; 4];
    for (v, &(live, sat, _)) in VARIANTS.iter().enumerate() {
        let start = Instant::now();
        let _ = extract_region_statewalk(g, region.root, projected_cost, live, sat);
        tiger_ns[v] = start.elapsed().as_nanos() as u64;

        // A second, untimed run gathers the frontier widths; the stat run
        // saturates cost ties and would skew the wall-clock numbers.
        let mut widths = Vec::new();
        statewalk_dp(g, region.root, projected_cost, live, sat, Some(&mut widths));
        width_max[v] = widths.iter().copied().max().unwrap_or(0);
        width_avg[v] = if widths.is_empty() {
            0.0
        } else {
            widths.iter().sum::<usize>() as f64 / widths.len() as f64
        };
    }

    let start = Instant::now();
    let (outcome, stats) = extract_region_ilp(g, region.root, projected_cost, config);
    let elapsed = start.elapsed().as_nanos() as u64;
    let (ilp_ns, ilp_timed_out, ilp_infeasible) = match outcome {
        IlpOutcome::Extraction(_) => (Some(elapsed), false, false),
        IlpOutcome::TimedOut => (None, true, false),
        IlpOutcome::Infeasible => (Some(elapsed), false, true),
        IlpOutcome::Failed => (None, false, false),
    };

    RegionTimingRow {
        egraph_size: g.n_classes(),
        tiger_ns,
        width_max,
        width_avg,
        ilp_ns,
        ilp_timed_out,
        ilp_infeasible,
        ilp_num_vars: stats.num_vars,
    }
}

fn row_json(row: &RegionTimingRow) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert("egraph_size".into(), json!(row.egraph_size));
    for (v, &(_, _, infix)) in VARIANTS.iter().enumerate() {
        obj.insert(format!("tiger_duration_{}_ns", infix), json!(row.tiger_ns[v]));
    }
    obj.insert("ilp_duration_ns".into(), json!(row.ilp_ns));
    obj.insert("ilp_timed_out".into(), json!(row.ilp_timed_out));
    obj.insert("ilp_infeasible".into(), json!(row.ilp_infeasible));
    obj.insert("ilp_encoding_num_vars".into(), json!(row.ilp_num_vars));
    for (v, &(_, _, infix)) in VARIANTS.iter().enumerate() {
        obj.insert(format!("statewalk_width_{}_max", infix), json!(row.width_max[v]));
        obj.insert(format!("statewalk_width_{}_avg", infix), json!(row.width_avg[v]));
    }
    serde_json::Value::Object(obj)
}

/// Run the harness over every region of every function root and write the
/// report to the configured path.
pub fn run_timing_harness(g: &EGraph, fun_roots: &[ClassId], config: &Config) -> Result<()> {
    let report_path = config
        .report_path
        .as_ref()
        .context("timing requires a report path")?;

    let effectful_roots: Vec<ClassId> = fun_roots
        .iter()
        .copied()
        .filter(|&r| g[r].effectful)
        .collect();
    let region_roots = find_region_roots(g, &effectful_roots);
    let statewalk_cost = cost::compute_statewalk_cost(g);

    let prepared: Vec<(Region, Vec<Vec<Cost>>)> = region_roots
        .iter()
        .map(|&root| {
            let region = construct_region(g, root);
            let projected =
                cost::project_statewalk_cost(&region.to_parent, &region.n_subregion, &statewalk_cost);
            (region, projected)
        })
        .collect();

    // An ILP invocation mostly blocks on the child process, so the pool is
    // sized well below the hardware thread count.
    let workers = std::thread::available_parallelism()
        .map(|p| p.get() / 11)
        .unwrap_or(1)
        .max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build timing worker pool")?;
    log::info!(
        "timing {} regions on {} workers",
        prepared.len(),
        workers
    );

    let rows: Vec<RegionTimingRow> = pool.install(|| {
        prepared
            .par_iter()
            .map(|(region, projected)| time_region(region, projected, config))
            .collect()
    });

    let report = json!({ "rows": rows.iter().map(row_json).collect::<Vec<_>>() });
    let text = serde_json::to_string_pretty(&report)?;
    std::fs::write(report_path, text)
        .with_context(|| format!("failed to write timing report to {}", report_path.display()))?;
    log::info!("wrote timing report to {}", report_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_rows_carry_every_field() {
        let row = RegionTimingRow {
            egraph_size: 3,
            tiger_ns: [10, 20, 30, 40],
            width_max: [1, 1, 2, 2],
            width_avg: [1.0, 1.0, 1.5, 1.5],
            ilp_ns: None,
            ilp_timed_out: true,
            ilp_infeasible: false,
            ilp_num_vars: 8,
        };
        let v = row_json(&row);
        assert_eq!(v["egraph_size"], 3);
        assert_eq!(v["tiger_duration_liveon_saton_ns"], 10);
        assert_eq!(v["tiger_duration_liveoff_satoff_ns"], 40);
        assert_eq!(v["ilp_duration_ns"], serde_json::Value::Null);
        assert_eq!(v["ilp_timed_out"], true);
        assert_eq!(v["ilp_infeasible"], false);
        assert_eq!(v["ilp_encoding_num_vars"], 8);
        assert_eq!(v["statewalk_width_liveoff_saton_max"], 2);
        assert_eq!(v["statewalk_width_liveon_saton_avg"], 1.0);
    }
}
