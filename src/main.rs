//! Extract one executable program per function from an e-graph with
//! effectful nodes, and print reconstruction rules for the upstream
//! rewriter. Input JSON on stdin, rules on stdout.

mod config;
mod cost;
mod egglog;
mod egraph;
mod extract;
mod parse;
mod region;
#[cfg(test)]
mod test_graphs;
mod timing;
mod validate;

use std::io::{Read, Write};

use anyhow::{Context, Result};

use config::Config;

fn main() {
    env_logger::init();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = run(&config) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    let (g, fun_roots) = parse::parse_egraph(&input)?;

    if config.time_ilp {
        return timing::run_timing_harness(&g, &fun_roots, config);
    }

    let extractions = region::extract_all_function_roots(&g, &fun_roots, config);
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    egglog::print_rules(&mut out, &g, &extractions).context("failed to write rules")?;
    out.flush().context("failed to flush stdout")?;
    Ok(())
}
