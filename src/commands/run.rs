use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use pdelab::time::AdaptiveConfig;
use pdelab::{CancelToken, PdeError, Problem, RunOutcome};
use tracing::info;

use super::EXIT_NOT_CONVERGED;

#[derive(Args)]
pub struct RunArgs {
    /// Problem description (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Directory for problem.json and result.json
    #[arg(short, long, default_value = "output")]
    pub output: PathBuf,

    /// Use step-doubling error control instead of uniform steps
    #[arg(long)]
    pub adaptive: bool,

    /// Local error tolerance for --adaptive
    #[arg(long, default_value = "1e-5")]
    pub adaptive_tol: f64,
}

pub fn execute(args: RunArgs) -> Result<ExitCode> {
    let mut problem = Problem::load(&args.config)
        .with_context(|| format!("cannot load problem {}", args.config.display()))?;

    if args.adaptive {
        let Some(time) = problem.time.as_mut() else {
            return Err(PdeError::Configuration(
                "--adaptive requires a problem with time settings".to_string(),
            )
            .into());
        };
        time.adaptive = Some(AdaptiveConfig {
            initial_dt: time.final_time / time.steps.max(1) as f64,
            tolerance: args.adaptive_tol,
            min_dt: 1e-10,
        });
        problem.validate()?;
    }

    let outcome = pdelab::run(&problem, &CancelToken::new())?;
    write_artifacts(&args.output, &problem, &outcome)?;
    print_summary(&outcome);
    Ok(ExitCode::from(exit_status(&outcome)))
}

/// Solver failures, including a failed time step, are reported through
/// the outcome rather than as errors.
fn exit_status(outcome: &RunOutcome) -> u8 {
    if outcome.succeeded() {
        0
    } else {
        EXIT_NOT_CONVERGED
    }
}

fn write_artifacts(dir: &Path, problem: &Problem, outcome: &RunOutcome) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("cannot create output directory {}", dir.display()))?;

    let problem_path = dir.join("problem.json");
    fs::write(&problem_path, problem.to_json_pretty()?)
        .with_context(|| format!("cannot write {}", problem_path.display()))?;

    let result_path = dir.join("result.json");
    let json = serde_json::to_string_pretty(outcome).context("cannot serialise run result")?;
    fs::write(&result_path, json)
        .with_context(|| format!("cannot write {}", result_path.display()))?;

    info!(dir = %dir.display(), "run artifacts written");
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    println!("problem     {}", outcome.problem);
    println!("operator    {}", outcome.pde);
    println!("nodes       {}", outcome.nodes);
    println!("status      {}", outcome.status);
    if let Some(step) = outcome.failed_step {
        println!("failed step {step}");
    }
    println!("time        {:.6e}", outcome.time);
    println!("iterations  {}", outcome.linear_iterations);
    println!("residual    {:.3e}", outcome.relative_residual);
    println!("L2 error    {:.6e}", outcome.errors.l2);
    println!("Linf error  {:.6e}", outcome.errors.linf);
    println!("H1 error    {:.6e}", outcome.errors.h1_semi);
    println!("wall time   {:.3} s", outcome.wall_time_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_step_is_an_outcome_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("starved.json");
        fs::write(
            &config,
            r#"{
                "name": "starved",
                "pde": "diffusion",
                "axes": [{"cells": 16}, {"cells": 16}],
                "solution": {"kind": "bilinear"},
                "solver": {"max_iterations": 1},
                "time": {"final_time": 1.0, "steps": 4}
            }"#,
        )
        .unwrap();
        let output = dir.path().join("out");
        let args = RunArgs {
            config,
            output: output.clone(),
            adaptive: false,
            adaptive_tol: 1e-5,
        };
        assert!(execute(args).is_ok());

        let json = fs::read_to_string(output.join("result.json")).unwrap();
        let outcome: RunOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(outcome.failed_step, Some(1));
        assert_eq!(exit_status(&outcome), EXIT_NOT_CONVERGED);
    }
}
