//! Process-wide configuration, parsed once from the command line and
//! immutable afterwards.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IlpSolver {
    Gurobi,
    Cbc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Statewalk,
    Ilp,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `--report-region-timings <path>`
    pub report_path: Option<PathBuf>,
    /// `--ilp-mode`
    pub ilp_mode: bool,
    /// Cleared by `--ilp-no-minimize`.
    pub ilp_minimize: bool,
    /// `--time-ilp`
    pub time_ilp: bool,
    /// `--ilp-solver gurobi|cbc`
    pub ilp_solver: IlpSolver,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            report_path: None,
            ilp_mode: false,
            ilp_minimize: true,
            time_ilp: false,
            ilp_solver: IlpSolver::Cbc,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let mut args = pico_args::Arguments::from_env();
        let mut config = Config {
            report_path: args.opt_value_from_str("--report-region-timings")?,
            ilp_mode: args.contains("--ilp-mode"),
            ilp_minimize: !args.contains("--ilp-no-minimize"),
            time_ilp: args.contains("--time-ilp"),
            ..Config::default()
        };
        if let Some(solver) = args.opt_value_from_str::<_, String>("--ilp-solver")? {
            config.ilp_solver = match solver.as_str() {
                "gurobi" => IlpSolver::Gurobi,
                "cbc" => IlpSolver::Cbc,
                other => bail!("unknown ILP solver: {other}"),
            };
        }
        let rest = args.finish();
        if !rest.is_empty() {
            bail!("unknown argument: {}", rest[0].to_string_lossy());
        }
        if !config.ilp_minimize && !config.ilp_mode {
            bail!("--ilp-no-minimize requires --ilp-mode");
        }
        if config.time_ilp && config.report_path.is_none() {
            bail!("--time-ilp requires --report-region-timings");
        }
        Ok(config)
    }

    pub fn engine(&self) -> Engine {
        if self.ilp_mode {
            Engine::Ilp
        } else {
            Engine::Statewalk
        }
    }

    /// Per-region solver budget. Gurobi gets far longer because it is the
    /// solver of choice when installed; CBC is the widely available fallback
    /// and is only expected to crack small regions.
    pub fn ilp_timeout(&self) -> Duration {
        match self.ilp_solver {
            IlpSolver::Gurobi => Duration::from_secs(300),
            IlpSolver::Cbc => Duration::from_secs(10),
        }
    }
}
