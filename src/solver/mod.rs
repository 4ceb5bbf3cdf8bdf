//! Iterative linear solvers for the assembled systems.
//!
//! The default method is chosen from the system: conjugate residual for
//! symmetric systems and restarted GMRES otherwise. Both minimise the
//! residual norm over a growing Krylov space, so the residual never
//! increases from one iteration to the next. Preconditioned CG is available
//! for SPD systems and falls back to GMRES when its recurrence breaks down.

mod krylov;
mod multigrid;
mod preconditioner;
pub mod vector;

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{PdeError, Result};
use crate::field::Field;
use crate::operator::LinearSystem;

pub use krylov::SolveSession;
pub use preconditioner::PreconditionerKind;

/// Krylov dimension used by GMRES unless configured otherwise.
pub const DEFAULT_RESTART: usize = 150;

/// Why a solve stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergenceCause {
    /// Residual exceeded `divergence_factor` times the initial residual.
    ResidualGrowth,
    NonFinite,
    /// The Krylov recurrence hit a zero pivot.
    Breakdown,
    Cancelled,
}

impl fmt::Display for DivergenceCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DivergenceCause::ResidualGrowth => "residual growth",
            DivergenceCause::NonFinite => "non-finite residual",
            DivergenceCause::Breakdown => "breakdown",
            DivergenceCause::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "cause", rename_all = "kebab-case")]
pub enum SolverStatus {
    Running,
    Converged,
    /// Budget exhausted. Reported, not fatal: callers decide.
    IterationLimitReached,
    Diverged(DivergenceCause),
}

impl SolverStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, SolverStatus::Converged)
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverStatus::Running => f.write_str("running"),
            SolverStatus::Converged => f.write_str("converged"),
            SolverStatus::IterationLimitReached => f.write_str("iteration limit reached"),
            SolverStatus::Diverged(cause) => write!(f, "diverged ({cause})"),
        }
    }
}

/// Iterative method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SolverMethod {
    /// Conjugate residual when the system is symmetric, GMRES otherwise.
    #[default]
    Auto,
    ConjugateResidual,
    Gmres {
        #[serde(default = "default_restart")]
        restart: usize,
    },
    Pcg {
        #[serde(default)]
        preconditioner: PreconditionerKind,
    },
}

fn default_restart() -> usize {
    DEFAULT_RESTART
}

impl SolverMethod {
    /// Replace `Auto` by the concrete method for `system`.
    pub fn resolve(self, system: &LinearSystem) -> SolverMethod {
        match self {
            SolverMethod::Auto if system.is_symmetric() => SolverMethod::ConjugateResidual,
            SolverMethod::Auto => SolverMethod::Gmres {
                restart: DEFAULT_RESTART,
            },
            other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SolverMethod::Auto => "auto",
            SolverMethod::ConjugateResidual => "conjugate-residual",
            SolverMethod::Gmres { .. } => "gmres",
            SolverMethod::Pcg { .. } => "pcg",
        }
    }
}

/// Linear solver settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub method: SolverMethod,
    /// Stop when `||r|| / ||r0|| < tolerance`.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Give up when `||r|| > divergence_factor * ||r0||`.
    pub divergence_factor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: SolverMethod::Auto,
            tolerance: 1e-10,
            max_iterations: 10_000,
            divergence_factor: 1e6,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(PdeError::config(format!(
                "solver tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(PdeError::config("solver max_iterations must be at least 1"));
        }
        if self.divergence_factor.is_nan() || self.divergence_factor <= 1.0 {
            return Err(PdeError::config(format!(
                "divergence_factor must exceed 1, got {}",
                self.divergence_factor
            )));
        }
        match self.method {
            SolverMethod::Gmres { restart: 0 } => {
                Err(PdeError::config("gmres restart must be at least 1"))
            }
            SolverMethod::Pcg {
                preconditioner: PreconditionerKind::Ssor { omega },
            } if omega.is_nan() || omega <= 0.0 || omega >= 2.0 => Err(PdeError::config(format!(
                "ssor omega must lie in (0, 2), got {omega}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Outcome of a linear solve.
#[derive(Debug, Clone)]
pub struct SolverState<'g> {
    pub iterate: Field<'g>,
    pub residual_norm: f64,
    pub initial_residual: f64,
    pub iterations: usize,
    pub status: SolverStatus,
    /// Method that produced the iterate, after `Auto` resolution and fallback.
    pub method: SolverMethod,
    pub residual_history: Vec<f64>,
}

impl SolverState<'_> {
    pub fn relative_residual(&self) -> f64 {
        if self.initial_residual > 0.0 {
            self.residual_norm / self.initial_residual
        } else {
            0.0
        }
    }
}

/// Solve `A x = rhs` starting from `guess`.
///
/// Never fails: non-convergence is reported through [`SolverState::status`]
/// together with the furthest iterate reached. The cancellation token is
/// checked before every iteration.
pub fn solve<'g>(
    system: &LinearSystem,
    rhs: &Field<'g>,
    guess: Field<'g>,
    config: &SolverConfig,
    cancel: &CancelToken,
) -> SolverState<'g> {
    let grid = guess.grid();
    let mut session = SolveSession::new(system, rhs.values(), guess.into_values(), config);
    drive(&mut session, cancel);

    let initial_residual = session.initial_residual();
    let mut iterations = session.iterations();
    let mut status = session.status();
    let mut method = session.method();
    let mut residual_norm = session.residual_norm();
    let (mut x, mut history) = session.into_parts();

    let fell_over = matches!(
        status,
        SolverStatus::Diverged(DivergenceCause::Breakdown | DivergenceCause::ResidualGrowth)
    );
    let is_pcg = matches!(method, SolverMethod::Pcg { .. });
    if fell_over && is_pcg && iterations < config.max_iterations {
        warn!(
            iterations,
            %status,
            "pcg failed, system is not positive definite; falling back to gmres"
        );
        let fallback = SolverConfig {
            method: SolverMethod::Gmres {
                restart: DEFAULT_RESTART,
            },
            max_iterations: config.max_iterations - iterations,
            ..*config
        };
        let mut session = SolveSession::with_reference(
            system,
            rhs.values(),
            x,
            &fallback,
            Some(initial_residual),
        );
        drive(&mut session, cancel);
        iterations += session.iterations();
        status = session.status();
        method = session.method();
        residual_norm = session.residual_norm();
        let (fx, fh) = session.into_parts();
        x = fx;
        history.extend_from_slice(&fh[1..]);
    }

    debug!(
        method = method.name(),
        iterations,
        residual = residual_norm,
        initial_residual,
        %status,
        "linear solve finished"
    );

    SolverState {
        iterate: Field::from_solver(grid, x),
        residual_norm,
        initial_residual,
        iterations,
        status,
        method,
        residual_history: history,
    }
}

fn drive(session: &mut SolveSession<'_>, cancel: &CancelToken) {
    while session.status() == SolverStatus::Running {
        if cancel.is_cancelled() {
            session.cancel();
            break;
        }
        session.iterate();
    }
}
