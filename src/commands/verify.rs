use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use pdelab::CancelToken;
use pdelab::convergence::{render_markdown, run_suite, standard_suite};
use tracing::{info, warn};

use super::EXIT_VERIFICATION_FAILED;

#[derive(Args)]
pub struct VerifyArgs {
    /// Write a Markdown report to this file
    #[arg(short, long)]
    pub report: Option<PathBuf>,

    /// Two refinement levels per study instead of three
    #[arg(long)]
    pub quick: bool,
}

pub fn execute(args: VerifyArgs) -> Result<ExitCode> {
    let studies = standard_suite(args.quick);
    info!(studies = studies.len(), quick = args.quick, "verification started");
    let reports = run_suite(&studies, &CancelToken::new());

    println!(
        "{:<26} {:>8} {:>10} {:>10} {:>8}  result",
        "study", "expected", "observed", "fitted", "R^2"
    );
    for r in &reports {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
        println!(
            "{:<26} {:>8} {:>10} {:>10} {:>8}  {}",
            r.name,
            r.expected_order,
            fmt(r.finest_order()),
            fmt(r.fitted.map(|f| f.slope)),
            fmt(r.fitted.map(|f| f.r_squared)),
            if r.passed { "pass" } else { "FAIL" },
        );
    }

    if let Some(path) = &args.report {
        fs::write(path, render_markdown(&reports))
            .with_context(|| format!("cannot write report {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.as_str())
        .collect();
    if failed.is_empty() {
        info!("all studies passed");
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(failed = ?failed, "verification failed");
        Ok(ExitCode::from(EXIT_VERIFICATION_FAILED))
    }
}
