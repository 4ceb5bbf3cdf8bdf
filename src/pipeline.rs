//! One complete run: problem -> grid -> operator -> solver or integrator.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{PdeError, Result};
use crate::field::{Field, FieldSample};
use crate::grid::Grid;
use crate::norms::ErrorNorms;
use crate::operator::Operator;
use crate::problem::{Forcing, Problem};
use crate::solver::{self, SolverState, SolverStatus};
use crate::time::{IntegrationStats, StepRecord, TimeIntegrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Keep field samples in the outcome.
    pub record_samples: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            record_samples: true,
        }
    }
}

/// Result record of a run, ready to be serialised by the caller.
///
/// On failure the record holds the furthest state reached: the last
/// converged iterate or the partial sequence of time samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub problem: String,
    pub pde: String,
    pub nodes: usize,
    pub spacing: Vec<f64>,
    pub status: SolverStatus,
    /// Step whose solve failed, for transient runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    /// Time of the reported state.
    pub time: f64,
    pub linear_iterations: usize,
    pub relative_residual: f64,
    pub errors: ErrorNorms,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    pub samples: Vec<FieldSample>,
    pub wall_time_seconds: f64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status.is_converged() && self.failed_step.is_none()
    }
}

/// Right-hand side of the steady system `-L_h u = f + c(g)`, with the
/// Dirichlet values on Dirichlet rows.
pub fn steady_rhs<'g>(grid: &'g Grid, operator: &Operator, forcing: &impl Forcing) -> Field<'g> {
    let mut rhs = Field::zeros(grid);
    let values = rhs.values_mut();
    for (i, v) in values.iter_mut().enumerate() {
        let x = grid.position(i);
        *v = if operator.is_unknown(i) {
            forcing.source(x, 0.0)
        } else {
            forcing.dirichlet(x, 0.0)
        };
    }
    operator.add_boundary_term(|x, a, s| forcing.neumann(x, 0.0, a, s), values);
    rhs
}

/// Defect corrections allowed for a nonlinear operator.
const MAX_CORRECTIONS: usize = 200;
/// Corrections stop once an update is below this, relative to the solution.
const CORRECTION_TOLERANCE: f64 = 1e-8;

/// Solve the steady problem `-L u = f` on `grid`.
///
/// A nonlinear (limited) operator is solved by defect correction: each
/// pass solves the upwind system `-L_up u_{k+1} = f + c(g) + (L - L_up) u_k`
/// until the iterates settle. Linear iterations and residual histories
/// accumulate over the passes.
pub fn solve_steady<'g>(
    problem: &Problem,
    grid: &'g Grid,
    operator: &Operator,
    forcing: &impl Forcing,
    cancel: &CancelToken,
) -> SolverState<'g> {
    let system = operator.system(0.0, -1.0);
    let rhs = steady_rhs(grid, operator, forcing);
    let mut state = solver::solve(&system, &rhs, Field::zeros(grid), &problem.solver, cancel);
    if operator.is_linear() {
        return state;
    }

    for pass in 1..=MAX_CORRECTIONS {
        if !state.status.is_converged() {
            return state;
        }
        let mut corrected = rhs.clone();
        operator.add_limiter_correction(state.iterate.values(), corrected.values_mut());
        let guess = state.iterate.clone();
        let mut next = solver::solve(&system, &corrected, guess, &problem.solver, cancel);

        let change = next
            .iterate
            .values()
            .iter()
            .zip(state.iterate.values())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        let scale = next.iterate.values().iter().fold(1.0_f64, |m, v| m.max(v.abs()));

        next.iterations += state.iterations;
        next.initial_residual = state.initial_residual;
        let mut history = std::mem::take(&mut state.residual_history);
        history.extend_from_slice(&next.residual_history);
        next.residual_history = history;
        state = next;

        if change <= CORRECTION_TOLERANCE * scale {
            debug!(corrections = pass, iterations = state.iterations, "defect correction settled");
            return state;
        }
    }
    if state.status.is_converged() {
        warn!(corrections = MAX_CORRECTIONS, "defect correction did not settle");
        state.status = SolverStatus::IterationLimitReached;
    }
    state
}

/// Run a validated problem with default options.
pub fn run(problem: &Problem, cancel: &CancelToken) -> Result<RunOutcome> {
    run_with(problem, &RunOptions::default(), cancel)
}

/// Run a problem. Configuration problems are errors; solver failures are
/// reported in the outcome.
pub fn run_with(
    problem: &Problem,
    options: &RunOptions,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let started = Instant::now();
    problem.validate()?;
    let grid = problem.grid()?;
    let kind = problem.kind()?;
    let operator = Operator::build(&grid, kind, &problem.coefficients())?;
    let forcing = problem.manufactured(&grid);
    info!(
        problem = %problem.name,
        pde = %kind,
        nodes = grid.len(),
        unknowns = operator.unknown_count(),
        "run started"
    );

    let mut outcome = RunOutcome {
        problem: problem.name.clone(),
        pde: kind.to_string(),
        nodes: grid.len(),
        spacing: grid.axes().iter().map(|a| a.spacing).collect(),
        status: SolverStatus::Running,
        failed_step: None,
        time: 0.0,
        linear_iterations: 0,
        relative_residual: 0.0,
        errors: ErrorNorms::default(),
        integration: None,
        steps: Vec::new(),
        samples: Vec::new(),
        wall_time_seconds: 0.0,
    };

    match &problem.time {
        None => {
            let state = solve_steady(problem, &grid, &operator, &forcing, cancel);
            let exact = forcing.exact_field(&grid, 0.0);
            outcome.status = state.status;
            outcome.linear_iterations = state.iterations;
            outcome.relative_residual = state.relative_residual();
            outcome.errors = ErrorNorms::compute(&state.iterate, &exact);
            if options.record_samples {
                outcome.samples.push(FieldSample::new(0, 0.0, &state.iterate));
            }
        }
        Some(time) => {
            let initial = forcing.exact_field(&grid, 0.0);
            let mut integrator = TimeIntegrator::new(
                &operator,
                &forcing,
                initial,
                time,
                problem.solver,
                cancel.clone(),
            )?;
            outcome.status = SolverStatus::Converged;
            for item in integrator.snapshots() {
                match item {
                    Ok(snap) => {
                        if options.record_samples {
                            let sample = FieldSample::new(snap.step, snap.time, &snap.field);
                            outcome.samples.push(sample);
                        }
                    }
                    Err(PdeError::StepSolveFailed { step, status, .. }) => {
                        outcome.status = status;
                        outcome.failed_step = Some(step);
                    }
                    Err(other) => return Err(other),
                }
            }
            let t = integrator.time();
            let exact = forcing.exact_field(&grid, t);
            let stats = integrator.stats();
            outcome.time = t;
            outcome.errors = ErrorNorms::compute(integrator.state(), &exact);
            outcome.linear_iterations = stats.linear_iterations;
            outcome.relative_residual = stats.max_relative_residual;
            outcome.steps = integrator.history().to_vec();
            outcome.integration = Some(stats);
        }
    }

    outcome.wall_time_seconds = started.elapsed().as_secs_f64();
    if outcome.succeeded() {
        info!(
            status = %outcome.status,
            l2_error = outcome.errors.l2,
            linf_error = outcome.errors.linf,
            iterations = outcome.linear_iterations,
            "run finished"
        );
    } else {
        warn!(
            status = %outcome.status,
            failed_step = ?outcome.failed_step,
            "run did not converge; reporting furthest state"
        );
    }
    Ok(outcome)
}
