use std::process::ExitCode;

use anyhow::{Result, ensure};
use clap::Args;
use pdelab::bench::run_kernels;

#[derive(Args)]
pub struct BenchArgs {
    /// Cells per axis of the 2D benchmark grid
    #[arg(long, default_value = "64")]
    pub cells: usize,

    /// Timed calls per kernel
    #[arg(long, default_value = "200")]
    pub iterations: usize,
}

pub fn execute(args: BenchArgs) -> Result<ExitCode> {
    ensure!(args.iterations > 0, "--iterations must be positive");
    let timings = run_kernels(args.cells, args.iterations)?;
    println!("{:<40} {:>12} {:>12}", "kernel", "mean ns", "min ns");
    for t in &timings {
        println!("{:<40} {:>12.0} {:>12.0}", t.name, t.mean_ns, t.min_ns);
    }
    Ok(ExitCode::SUCCESS)
}
