//! Time integration of `u_t = L_h u + c(g) + f`.
//!
//! Explicit Euler is checked against the stability limit of the operator at
//! construction. Implicit schemes (backward Euler, Crank-Nicolson) solve one
//! linear system per step; a step whose solve does not converge ends the run
//! with [`PdeError::StepSolveFailed`].

mod snapshots;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{PdeError, Result};
use crate::field::Field;
use crate::grid::Grid;
use crate::operator::{LinearSystem, Operator};
use crate::problem::Forcing;
use crate::solver::{self, DivergenceCause, SolverConfig, SolverStatus};

pub use snapshots::{Snapshot, Snapshots};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    ForwardEuler,
    #[default]
    BackwardEuler,
    CrankNicolson,
}

impl Scheme {
    /// Temporal order of accuracy.
    pub fn order(self) -> u32 {
        match self {
            Scheme::ForwardEuler | Scheme::BackwardEuler => 1,
            Scheme::CrankNicolson => 2,
        }
    }

    pub fn is_explicit(self) -> bool {
        self == Scheme::ForwardEuler
    }

    /// Implicitness weight of the theta method.
    fn theta(self) -> f64 {
        match self {
            Scheme::ForwardEuler => 0.0,
            Scheme::BackwardEuler => 1.0,
            Scheme::CrankNicolson => 0.5,
        }
    }

    /// Time within the step at which the source is sampled.
    fn source_offset(self) -> f64 {
        match self {
            Scheme::ForwardEuler => 0.0,
            Scheme::BackwardEuler => 1.0,
            Scheme::CrankNicolson => 0.5,
        }
    }
}

fn default_min_dt() -> f64 {
    1e-10
}

/// Step-doubling error control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub initial_dt: f64,
    /// Accepted local error per step, in the discrete L2 norm.
    pub tolerance: f64,
    #[serde(default = "default_min_dt")]
    pub min_dt: f64,
}

/// How the interval `[0, final_time]` is divided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepPolicy {
    Steps(usize),
    Adaptive(AdaptiveConfig),
}

fn default_steps() -> usize {
    100
}

fn default_sample_every() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConfig {
    pub final_time: f64,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Enables step doubling; `steps` is then ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveConfig>,
    /// Emit a snapshot every this many accepted steps.
    #[serde(default = "default_sample_every")]
    pub sample_every: usize,
}

impl TimeConfig {
    pub fn new(final_time: f64, scheme: Scheme, steps: usize) -> Self {
        Self {
            final_time,
            scheme,
            steps,
            adaptive: None,
            sample_every: 1,
        }
    }

    pub fn policy(&self) -> StepPolicy {
        match self.adaptive {
            Some(adaptive) => StepPolicy::Adaptive(adaptive),
            None => StepPolicy::Steps(self.steps),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.final_time.is_finite() && self.final_time > 0.0) {
            return Err(PdeError::config(format!(
                "final_time must be positive, got {}",
                self.final_time
            )));
        }
        if self.sample_every == 0 {
            return Err(PdeError::config("sample_every must be at least 1"));
        }
        match self.policy() {
            StepPolicy::Steps(0) => Err(PdeError::config("steps must be at least 1")),
            StepPolicy::Steps(_) => Ok(()),
            StepPolicy::Adaptive(a) => {
                let positive = |v: f64| v.is_finite() && v > 0.0;
                if !(positive(a.initial_dt) && positive(a.tolerance) && positive(a.min_dt)) {
                    return Err(PdeError::config(
                        "adaptive initial_dt, tolerance and min_dt must be positive",
                    ));
                }
                if a.min_dt > a.initial_dt {
                    return Err(PdeError::config("adaptive min_dt exceeds initial_dt"));
                }
                Ok(())
            }
        }
    }
}

/// One attempted step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    /// Time at the end of the step.
    pub time: f64,
    pub dt: f64,
    /// Step-doubling error estimate, adaptive runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_estimate: Option<f64>,
    pub accepted: bool,
    pub linear_iterations: usize,
}

/// Totals over an integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub steps: usize,
    pub rejected_steps: usize,
    pub linear_iterations: usize,
    /// Largest final relative residual of any linear solve.
    pub max_relative_residual: f64,
}

/// Result of advancing one state by one step.
struct Advance<'g> {
    state: Field<'g>,
    iterations: usize,
    relative_residual: f64,
}

/// Advances a field in time, one step or one snapshot at a time.
#[derive(Debug, Clone)]
pub struct TimeIntegrator<'g, F: Forcing> {
    grid: &'g Grid,
    operator: &'g Operator,
    forcing: &'g F,
    scheme: Scheme,
    policy: StepPolicy,
    final_time: f64,
    sample_every: usize,
    solver: SolverConfig,
    cancel: CancelToken,
    state: Field<'g>,
    time: f64,
    step: usize,
    dt: f64,
    explicit_limit: f64,
    /// System for the uniform step size.
    implicit: Option<LinearSystem>,
    history: Vec<StepRecord>,
    stats: IntegrationStats,
    /// Status of the step that ended the run. Once set the integrator is
    /// finished and every further step reports it again.
    failed: Option<SolverStatus>,
    /// Whether the initial state has been handed out as a snapshot.
    initial_emitted: bool,
}

impl<'g, F: Forcing> TimeIntegrator<'g, F> {
    /// Fails with [`PdeError::StabilityViolation`] when an explicit scheme is
    /// asked to take a step above the operator's stability limit. A step
    /// exactly at the limit is accepted.
    pub fn new(
        operator: &'g Operator,
        forcing: &'g F,
        initial: Field<'g>,
        config: &TimeConfig,
        solver: SolverConfig,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate()?;
        solver.validate()?;
        let grid = initial.grid();
        if operator.len() != grid.len() {
            return Err(PdeError::config(format!(
                "operator has {} rows but the field has {} nodes",
                operator.len(),
                grid.len()
            )));
        }

        let policy = config.policy();
        let dt = match policy {
            StepPolicy::Steps(n) => config.final_time / n as f64,
            StepPolicy::Adaptive(a) => a.initial_dt.min(config.final_time),
        };
        let explicit_limit = operator.explicit_step_limit();
        if config.scheme.is_explicit() && dt > explicit_limit {
            return Err(PdeError::StabilityViolation {
                dt,
                limit: explicit_limit,
            });
        }

        let implicit = match (policy, config.scheme.is_explicit()) {
            (StepPolicy::Steps(_), false) => {
                Some(operator.system(1.0, -config.scheme.theta() * dt))
            }
            _ => None,
        };

        debug!(
            scheme = ?config.scheme,
            dt,
            explicit_limit,
            final_time = config.final_time,
            "time integrator ready"
        );

        Ok(Self {
            grid,
            operator,
            forcing,
            scheme: config.scheme,
            policy,
            final_time: config.final_time,
            sample_every: config.sample_every,
            solver,
            cancel,
            state: initial,
            time: 0.0,
            step: 0,
            dt,
            explicit_limit,
            implicit,
            history: Vec::new(),
            stats: IntegrationStats::default(),
            failed: None,
            initial_emitted: false,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of accepted steps so far.
    pub fn step_index(&self) -> usize {
        self.step
    }

    /// Latest accepted state. After a failed step this is the last good one.
    pub fn state(&self) -> &Field<'g> {
        &self.state
    }

    pub fn into_state(self) -> Field<'g> {
        self.state
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn stats(&self) -> IntegrationStats {
        self.stats
    }

    pub fn explicit_limit(&self) -> f64 {
        self.explicit_limit
    }

    /// Status of the step that ended the run, if one failed.
    pub fn failed_status(&self) -> Option<SolverStatus> {
        self.failed
    }

    /// True once the final time is reached or a step has failed.
    pub fn is_finished(&self) -> bool {
        if self.failed.is_some() {
            return true;
        }
        match self.policy {
            StepPolicy::Steps(n) => self.step >= n,
            StepPolicy::Adaptive(_) => self.time >= self.final_time,
        }
    }

    pub(crate) fn sample_every(&self) -> usize {
        self.sample_every
    }

    /// Marks the initial state as emitted. Returns false if it already was.
    pub(crate) fn take_initial(&mut self) -> bool {
        let first = !self.initial_emitted && self.step == 0 && self.failed.is_none();
        self.initial_emitted = true;
        first
    }

    /// Lazy sequence of snapshots: the initial state, then every
    /// `sample_every`-th step, always ending with the final step.
    pub fn snapshots(&mut self) -> Snapshots<'_, 'g, F> {
        Snapshots::new(self)
    }

    /// Advance by one accepted step.
    ///
    /// After a failed step the integrator is terminal: this returns the same
    /// [`PdeError::StepSolveFailed`] without attempting another solve.
    pub fn step(&mut self) -> Result<()> {
        if let Some(status) = self.failed {
            return Err(self.step_error(status));
        }
        if self.is_finished() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(self.failure(SolverStatus::Diverged(DivergenceCause::Cancelled)));
        }
        match self.policy {
            StepPolicy::Steps(n) => self.uniform_step(n),
            StepPolicy::Adaptive(a) => self.adaptive_step(a),
        }
    }

    fn step_error(&self, status: SolverStatus) -> PdeError {
        PdeError::StepSolveFailed {
            step: self.step + 1,
            time: self.time,
            status,
        }
    }

    fn failure(&mut self, status: SolverStatus) -> PdeError {
        warn!(step = self.step + 1, time = self.time, %status, "time step failed");
        self.failed = Some(status);
        self.step_error(status)
    }

    fn uniform_step(&mut self, n: usize) -> Result<()> {
        let dt = self.dt;
        let next = self.advance(&self.state, self.time, dt, self.implicit.as_ref());
        let adv = match next {
            Ok(adv) => adv,
            Err(status) => return Err(self.failure(status)),
        };

        self.step += 1;
        self.time = if self.step == n {
            self.final_time
        } else {
            self.step as f64 * dt
        };
        self.commit(adv, dt, None);
        Ok(())
    }

    fn adaptive_step(&mut self, cfg: AdaptiveConfig) -> Result<()> {
        let order = self.scheme.order() as i32;
        let denom = 2f64.powi(order) - 1.0;
        loop {
            let remaining = self.final_time - self.time;
            let dt = self.dt.min(remaining);

            let attempt = self.advance(&self.state, self.time, dt, None).and_then(|full| {
                let half = self.advance(&self.state, self.time, 0.5 * dt, None)?;
                let two = self.advance(&half.state, self.time + 0.5 * dt, 0.5 * dt, None)?;
                Ok((full, half, two))
            });
            let (full, half, two) = match attempt {
                Ok(advances) => advances,
                Err(status) => return Err(self.failure(status)),
            };

            let error = self.discrete_l2_diff(&full.state, &two.state) / denom;
            let factor = if error > 0.0 {
                (0.9 * (cfg.tolerance / error).powf(1.0 / (order as f64 + 1.0))).clamp(0.2, 2.0)
            } else {
                2.0
            };
            let mut next_dt = (dt * factor).max(cfg.min_dt);
            if self.scheme.is_explicit() {
                next_dt = next_dt.min(self.explicit_limit);
            }

            let accepted = error <= cfg.tolerance || dt <= cfg.min_dt;
            let iterations = full.iterations + half.iterations + two.iterations;
            if !accepted {
                self.stats.rejected_steps += 1;
                self.stats.linear_iterations += iterations;
                self.history.push(StepRecord {
                    step: self.step + 1,
                    time: self.time + dt,
                    dt,
                    error_estimate: Some(error),
                    accepted: false,
                    linear_iterations: iterations,
                });
                self.dt = next_dt;
                continue;
            }
            if error > cfg.tolerance {
                warn!(dt, error, "accepting step at minimum dt above tolerance");
            }

            self.step += 1;
            self.time += dt;
            if self.final_time - self.time <= 1e-12 * self.final_time {
                self.time = self.final_time;
            }
            let residual = full
                .relative_residual
                .max(half.relative_residual)
                .max(two.relative_residual);
            self.commit(
                Advance {
                    state: two.state,
                    iterations,
                    relative_residual: residual,
                },
                dt,
                Some(error),
            );
            self.dt = next_dt;
            return Ok(());
        }
    }

    fn commit(&mut self, adv: Advance<'g>, dt: f64, error_estimate: Option<f64>) {
        self.state = adv.state;
        self.stats.steps += 1;
        self.stats.linear_iterations += adv.iterations;
        self.stats.max_relative_residual =
            self.stats.max_relative_residual.max(adv.relative_residual);
        self.history.push(StepRecord {
            step: self.step,
            time: self.time,
            dt,
            error_estimate,
            accepted: true,
            linear_iterations: adv.iterations,
        });
    }

    fn discrete_l2_diff(&self, a: &Field<'_>, b: &Field<'_>) -> f64 {
        let sum: f64 = a
            .values()
            .iter()
            .zip(b.values())
            .map(|(x, y)| (x - y).powi(2))
            .sum();
        (sum * self.grid.cell_volume()).sqrt()
    }

    /// Compute the state at `t + dt` from `u` at `t`. Returns the solver
    /// status when the implicit solve does not converge.
    fn advance(
        &self,
        u: &Field<'g>,
        t: f64,
        dt: f64,
        cached: Option<&LinearSystem>,
    ) -> std::result::Result<Advance<'g>, SolverStatus> {
        let n = self.grid.len();
        let theta = self.scheme.theta();
        let t_new = t + dt;
        let t_src = t + self.scheme.source_offset() * dt;

        // Explicit part: (1 - theta) dt (L u + c(t)).
        let mut explicit = vec![0.0; n];
        if theta < 1.0 {
            self.operator.apply_slice(u.values(), &mut explicit);
            self.operator
                .add_boundary_term(|x, a, s| self.forcing.neumann(x, t, a, s), &mut explicit);
        }

        let mut rhs = vec![0.0; n];
        for i in 0..n {
            let x = self.grid.position(i);
            if !self.operator.is_unknown(i) {
                rhs[i] = self.forcing.dirichlet(x, t_new);
                continue;
            }
            let source = self.forcing.source(x, t_src);
            rhs[i] = u.values()[i] + (1.0 - theta) * dt * explicit[i] + dt * source;
        }
        if theta > 0.0 {
            let mut implicit_bc = vec![0.0; n];
            self.operator.add_boundary_term(
                |x, a, s| self.forcing.neumann(x, t_new, a, s),
                &mut implicit_bc,
            );
            // The system only holds the upwind part; the limiter
            // correction is lagged to the old state.
            self.operator.add_limiter_correction(u.values(), &mut implicit_bc);
            for i in 0..n {
                rhs[i] += theta * dt * implicit_bc[i];
            }
        }

        if self.scheme.is_explicit() {
            let values = rhs;
            if values.iter().any(|v| !v.is_finite()) {
                return Err(SolverStatus::Diverged(DivergenceCause::NonFinite));
            }
            return Ok(Advance {
                state: Field::from_solver(self.grid, values),
                iterations: 0,
                relative_residual: 0.0,
            });
        }

        let built;
        let system = match cached {
            Some(system) => system,
            None => {
                built = self.operator.system(1.0, -theta * dt);
                &built
            }
        };
        let rhs = Field::from_solver(self.grid, rhs);
        let result = solver::solve(system, &rhs, u.clone(), &self.solver, &self.cancel);
        if !result.status.is_converged() {
            return Err(result.status);
        }
        Ok(Advance {
            relative_residual: result.relative_residual(),
            iterations: result.iterations,
            state: result.iterate,
        })
    }
}
