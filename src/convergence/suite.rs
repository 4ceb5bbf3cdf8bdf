use std::fmt::Write as _;

use rayon::prelude::*;

use super::{ConvergenceReport, Refinement, Study, run_study};
use crate::cancel::CancelToken;
use crate::grid::{AxisSpec, BoundaryKind};
use crate::operator::FaceAveraging;
use crate::problem::{Diffusivity, ManufacturedSolution, Problem};
use crate::solver::SolverConfig;
use crate::time::{Scheme, TimeConfig};

fn square(name: &str, pde: &str, cells: usize, solution: ManufacturedSolution) -> Problem {
    Problem {
        name: name.to_string(),
        pde: pde.to_string(),
        diffusivity: Diffusivity::default(),
        velocity: Vec::new(),
        kappa_averaging: FaceAveraging::default(),
        axes: vec![AxisSpec::unit(cells), AxisSpec::unit(cells)],
        solution,
        solver: SolverConfig {
            tolerance: 1e-12,
            ..SolverConfig::default()
        },
        time: None,
    }
}

fn sine(modes: u32) -> ManufacturedSolution {
    ManufacturedSolution::SineProduct { modes }
}

/// The studies run by `pdelab verify`. `quick` keeps two levels per study.
pub fn standard_suite(quick: bool) -> Vec<Study> {
    let spatial_levels = if quick { 2 } else { 3 };
    let temporal_levels = if quick { 2 } else { 3 };

    let diffusion = square("diffusion-2d", "diffusion", 8, sine(1));

    let mut variable = square("variable-diffusion-2d", "variable-diffusion", 8, sine(1));
    variable.diffusivity = Diffusivity::Sinusoidal {
        base: 1.0,
        amplitude: 0.5,
    };
    variable.kappa_averaging = FaceAveraging::Harmonic;

    let mut mixed = square("mixed-neumann-2d", "diffusion", 8, sine(1));
    mixed.axes[0] = AxisSpec::unit(8).with_boundaries(BoundaryKind::Neumann, BoundaryKind::Neumann);

    let mut periodic = square("periodic-2d", "diffusion", 8, sine(2));
    periodic.axes[0] = AxisSpec::unit(8).periodic();

    let mut advection = square("advection-diffusion-2d", "advection-diffusion", 16, sine(1));
    advection.velocity = vec![4.0, 4.0];

    let temporal = |name: &str, scheme: Scheme| {
        let mut p = square(name, "diffusion", 8, ManufacturedSolution::Bilinear);
        p.time = Some(TimeConfig::new(1.0, scheme, 10));
        p
    };

    vec![
        Study::spatial("diffusion-2d", diffusion, spatial_levels, 2.0),
        Study::spatial("variable-diffusion-2d", variable, spatial_levels, 2.0),
        Study::spatial("mixed-neumann-2d", mixed, spatial_levels, 2.0),
        Study::spatial("periodic-2d", periodic, spatial_levels, 2.0),
        Study::spatial("advection-diffusion-2d", advection, spatial_levels, 1.0),
        Study::temporal(
            "temporal-backward-euler",
            temporal("temporal-backward-euler", Scheme::BackwardEuler),
            temporal_levels,
            1.0,
        ),
        Study::temporal(
            "temporal-crank-nicolson",
            temporal("temporal-crank-nicolson", Scheme::CrankNicolson),
            temporal_levels,
            2.0,
        ),
    ]
}

/// Run studies concurrently; reports keep the input order.
pub fn run_suite(studies: &[Study], cancel: &CancelToken) -> Vec<ConvergenceReport> {
    studies.par_iter().map(|s| run_study(s, cancel)).collect()
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"))
}

/// Markdown summary of a verification run.
pub fn render_markdown(reports: &[ConvergenceReport]) -> String {
    let passed = reports.iter().filter(|r| r.passed).count();
    let mut out = String::new();
    let _ = writeln!(out, "# Convergence report\n");
    let _ = writeln!(out, "{passed} of {} studies passed.\n", reports.len());
    let _ = writeln!(
        out,
        "| study | refinement | expected | band | observed | fitted | R^2 | result |"
    );
    let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
    for r in reports {
        let refinement = match r.refinement {
            Refinement::Space => "space",
            Refinement::Time => "time",
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} | [{}, {}] | {} | {} | {} | {} |",
            r.name,
            refinement,
            r.expected_order,
            r.band.min,
            r.band.max,
            fmt_opt(r.finest_order()),
            fmt_opt(r.fitted.map(|f| f.slope)),
            fmt_opt(r.fitted.map(|f| f.r_squared)),
            if r.passed { "pass" } else { "FAIL" },
        );
    }

    for r in reports {
        let _ = writeln!(out, "\n## {}\n", r.name);
        let _ = writeln!(
            out,
            "| level | resolution | spacing | L2 error | Linf error | order | iterations | status |"
        );
        let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
        for rec in &r.records {
            let status = match &rec.failure {
                Some(reason) => reason.clone(),
                None => rec.status.to_string(),
            };
            let _ = writeln!(
                out,
                "| {} | {} | {:.4e} | {:.4e} | {:.4e} | {} | {} | {} |",
                rec.level,
                rec.resolution,
                rec.spacing,
                rec.l2_error,
                rec.linf_error,
                fmt_opt(rec.observed_order),
                rec.iterations,
                status,
            );
        }
    }
    out
}
