pub mod bench;
mod cancel;
pub mod convergence;
mod error;
mod field;
pub mod grid;
pub mod norms;
pub mod operator;
pub mod pipeline;
pub mod problem;
pub mod solver;
pub mod time;

// Prelude
pub use cancel::CancelToken;
pub use convergence::{ConvergenceRecord, ConvergenceReport, Study, run_study};
pub use error::{PdeError, Result};
pub use field::{Field, FieldSample};
pub use grid::{AxisSpec, BoundaryKind, Grid, Side};
pub use operator::{LinearSystem, Operator, PdeKind};
pub use pipeline::{RunOutcome, run};
pub use problem::{Forcing, Problem};
pub use solver::{SolverConfig, SolverMethod, SolverState, SolverStatus, solve};
pub use time::{Scheme, TimeConfig, TimeIntegrator};
