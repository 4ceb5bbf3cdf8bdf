//! Timeable entry points into the numerical kernels.
//!
//! Each hook performs exactly one unit of work on state prepared by the
//! caller, so grid, operator and system construction stay outside any timed
//! region. The hooks hold no state of their own and are safe to time
//! concurrently on different inputs.

use std::hint::black_box;
use std::time::Instant;

use serde::Serialize;

use crate::error::Result;
use crate::field::Field;
use crate::grid::Grid;
use crate::operator::{LinearSystem, Operator};
use crate::pipeline::steady_rhs;
use crate::problem::{Forcing, ManufacturedProblem, Problem};
use crate::solver::{SolveSession, SolverConfig, SolverMethod, SolverStatus};
use crate::time::{Scheme, TimeConfig, TimeIntegrator};

/// One application `output = L input`.
#[inline]
pub fn apply_operator(operator: &Operator, input: &Field<'_>, output: &mut Field<'_>) {
    operator.apply(input, output);
}

/// One Krylov iteration of an open session.
#[inline]
pub fn solver_iteration(session: &mut SolveSession<'_>) -> SolverStatus {
    session.iterate()
}

/// One accepted time step.
#[inline]
pub fn integrator_step<F: Forcing>(integrator: &mut TimeIntegrator<'_, F>) -> Result<()> {
    integrator.step()
}

/// Everything the hooks need, built once per resolution.
pub struct KernelFixture {
    pub problem: Problem,
    pub time: TimeConfig,
    pub grid: Grid,
    pub operator: Operator,
    pub forcing: ManufacturedProblem,
    pub system: LinearSystem,
    pub rhs: Vec<f64>,
}

impl KernelFixture {
    /// 2D unit-square heat problem with `cells` cells per axis. The cosine
    /// data is not an eigenvector of the Dirichlet Laplacian, so Krylov
    /// sessions take many iterations.
    pub fn square(cells: usize) -> Result<Self> {
        let mut problem = Problem::from_json(&format!(
            r#"{{
                "name": "bench-{cells}",
                "pde": "diffusion",
                "axes": [{{"cells": {cells}}}, {{"cells": {cells}}}],
                "solution": {{"kind": "cosine-product", "modes": 3}}
            }}"#
        ))?;
        // Enough steps that a timing loop never reaches the final time.
        let time = TimeConfig::new(1.0, Scheme::CrankNicolson, 1 << 20);
        problem.time = Some(time.clone());
        problem.validate()?;

        let grid = problem.grid()?;
        let operator = Operator::build(&grid, problem.kind()?, &problem.coefficients())?;
        let forcing = problem.manufactured(&grid);
        let system = operator.system(0.0, -1.0);
        let rhs = steady_rhs(&grid, &operator, &forcing).into_values();
        Ok(Self {
            problem,
            time,
            grid,
            operator,
            forcing,
            system,
            rhs,
        })
    }

    pub fn input(&self) -> Field<'_> {
        self.forcing.exact_field(&self.grid, 0.0)
    }

    pub fn output(&self) -> Field<'_> {
        Field::zeros(&self.grid)
    }

    /// Fresh session on the steady system, before its first iteration.
    pub fn session(&self, method: SolverMethod) -> SolveSession<'_> {
        let config = SolverConfig {
            method,
            ..self.problem.solver
        };
        SolveSession::new(&self.system, &self.rhs, vec![0.0; self.grid.len()], &config)
    }

    /// Integrator at `t = 0` with its implicit system already assembled.
    pub fn integrator(&self) -> Result<TimeIntegrator<'_, ManufacturedProblem>> {
        TimeIntegrator::new(
            &self.operator,
            &self.forcing,
            self.input(),
            &self.time,
            self.problem.solver,
            Default::default(),
        )
    }
}

/// Result of an in-process timing loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    pub name: String,
    pub iterations: usize,
    pub mean_ns: f64,
    pub min_ns: f64,
}

/// Time `routine` `iterations` times. `setup` runs before every call and is
/// not measured.
pub fn time_batched<S, O>(
    name: &str,
    iterations: usize,
    mut setup: impl FnMut() -> S,
    mut routine: impl FnMut(&mut S) -> O,
) -> Timing {
    let mut total = 0.0;
    let mut min = f64::INFINITY;
    for _ in 0..iterations {
        let mut state = setup();
        let start = Instant::now();
        let out = routine(&mut state);
        let ns = start.elapsed().as_nanos() as f64;
        black_box(out);
        drop(state);
        total += ns;
        min = min.min(ns);
    }
    Timing {
        name: name.to_string(),
        iterations,
        mean_ns: if iterations > 0 { total / iterations as f64 } else { 0.0 },
        min_ns: if iterations > 0 { min } else { 0.0 },
    }
}

/// Time the three hooks on a `cells x cells` fixture.
pub fn run_kernels(cells: usize, iterations: usize) -> Result<Vec<Timing>> {
    let fixture = KernelFixture::square(cells)?;
    let input = fixture.input();
    let base = fixture.integrator()?;

    let mut out = Vec::new();
    let mut output = fixture.output();
    out.push(time_batched(
        &format!("apply_operator/{cells}"),
        iterations,
        || (),
        |_| apply_operator(&fixture.operator, &input, &mut output),
    ));
    for method in [SolverMethod::ConjugateResidual, SolverMethod::Gmres { restart: 30 }] {
        out.push(time_batched(
            &format!("solver_iteration/{}/{cells}", method.name()),
            iterations,
            || fixture.session(method),
            solver_iteration,
        ));
    }
    out.push(time_batched(
        &format!("integrator_step/{cells}"),
        iterations,
        || base.clone(),
        |integrator| integrator_step(integrator),
    ));
    Ok(out)
}
