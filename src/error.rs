use std::path::PathBuf;

use crate::solver::SolverStatus;

/// Errors raised by problem setup, operator assembly and time integration.
///
/// Linear-solver non-convergence is not an error: it is reported through
/// [`SolverStatus`] and the caller decides whether it is fatal.
#[derive(Debug, thiserror::Error)]
pub enum PdeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported operator type: {0:?}")]
    UnsupportedOperator(String),

    #[error("time step {dt:.6e} exceeds the explicit stability limit {limit:.6e}")]
    StabilityViolation { dt: f64, limit: f64 },

    /// A linear solve inside the time loop did not converge. `step` is the
    /// 1-based index of the step being computed, `time` the last accepted time.
    #[error("step {step} failed at t = {time:.6e}: solver {status}")]
    StepSolveFailed {
        step: usize,
        time: f64,
        status: SolverStatus,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid problem description: {0}")]
    Json(#[from] serde_json::Error),
}

impl PdeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PdeError::Configuration(msg.into())
    }

    /// True for errors caused by the problem description rather than the numerics.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PdeError::Configuration(_)
                | PdeError::UnsupportedOperator(_)
                | PdeError::StabilityViolation { .. }
                | PdeError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PdeError>;
