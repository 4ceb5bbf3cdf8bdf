//! Problem descriptions and the data that drives a solve.

mod manufactured;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PdeError, Result};
use crate::grid::{AxisSpec, Grid, MAX_DIM, Side};
use crate::operator::{Coefficients, FaceAveraging, PdeKind};
use crate::solver::SolverConfig;
use crate::time::TimeConfig;

pub use manufactured::{Diffusivity, Evaluation, ManufacturedProblem, ManufacturedSolution};

/// Source term and boundary data of an equation `u_t = L u + f`.
pub trait Forcing: Sync {
    fn source(&self, x: [f64; MAX_DIM], t: f64) -> f64;

    /// Prescribed value on Dirichlet faces.
    fn dirichlet(&self, x: [f64; MAX_DIM], t: f64) -> f64;

    /// Prescribed outward normal derivative on Neumann faces.
    fn neumann(&self, x: [f64; MAX_DIM], t: f64, axis: usize, side: Side) -> f64;
}

/// A complete, immutable description of one run.
///
/// Absent `time` means a steady problem `-L u = f`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub name: String,
    /// Operator tag, parsed into [`PdeKind`].
    pub pde: String,
    #[serde(default)]
    pub diffusivity: Diffusivity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub velocity: Vec<f64>,
    #[serde(default)]
    pub kappa_averaging: FaceAveraging,
    pub axes: Vec<AxisSpec>,
    pub solution: ManufacturedSolution,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeConfig>,
}

impl Problem {
    /// Parse and validate a JSON problem description.
    pub fn from_json(text: &str) -> Result<Self> {
        let problem: Problem = serde_json::from_str(text)?;
        problem.validate()?;
        Ok(problem)
    }

    /// Load and validate a problem file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| PdeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let problem: Problem = serde_json::from_reader(BufReader::new(file))?;
        problem.validate()?;
        Ok(problem)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn kind(&self) -> Result<PdeKind> {
        self.pde.parse()
    }

    pub fn is_steady(&self) -> bool {
        self.time.is_none()
    }

    /// Check every constraint that can be checked without assembling.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind()?;
        // Builds the grid only for its checks.
        let grid = Grid::new(&self.axes)?;

        self.diffusivity.validate()?;
        if self.velocity.len() > grid.dim() {
            return Err(PdeError::config(format!(
                "velocity has {} components but the grid has {} axes",
                self.velocity.len(),
                grid.dim()
            )));
        }
        if self.velocity.iter().any(|v| !v.is_finite()) {
            return Err(PdeError::config("velocity must be finite"));
        }
        match kind {
            PdeKind::Diffusion if !self.diffusivity.is_constant() => {
                return Err(PdeError::config(
                    "diffusion requires a constant diffusivity; use variable-diffusion",
                ));
            }
            PdeKind::Diffusion | PdeKind::VariableDiffusion
                if self.velocity.iter().any(|v| *v != 0.0) =>
            {
                return Err(PdeError::config(format!(
                    "{kind} does not take a velocity; use advection-diffusion"
                )));
            }
            _ => {}
        }

        self.solver.validate()?;
        match &self.time {
            Some(time) => time.validate()?,
            None if !grid.has_dirichlet_face() => {
                return Err(PdeError::config(
                    "a steady problem needs at least one Dirichlet face",
                ));
            }
            None => {}
        }
        Ok(())
    }

    pub fn grid(&self) -> Result<Grid> {
        Grid::new(&self.axes)
    }

    pub fn coefficients(&self) -> Coefficients {
        let mut velocity = [0.0; MAX_DIM];
        for (v, c) in velocity.iter_mut().zip(&self.velocity) {
            *v = *c;
        }
        Coefficients {
            diffusivity: self.diffusivity,
            velocity,
            averaging: self.kappa_averaging,
        }
    }

    /// Exact solution and forcing for this problem on `grid`.
    pub fn manufactured(&self, grid: &Grid) -> ManufacturedProblem {
        let coeffs = self.coefficients();
        ManufacturedProblem {
            solution: self.solution.clone(),
            diffusivity: coeffs.diffusivity,
            velocity: coeffs.velocity,
            geometry: grid.geometry(),
            steady: self.is_steady(),
        }
    }

    /// Copy with every axis resolution multiplied by `factor`.
    pub fn refined(&self, factor: usize) -> Problem {
        let mut out = self.clone();
        for axis in &mut out.axes {
            axis.cells *= factor;
        }
        out
    }

    /// Copy with a different number of uniform time steps.
    pub fn with_steps(&self, steps: usize) -> Problem {
        let mut out = self.clone();
        if let Some(time) = &mut out.time {
            time.steps = steps;
            time.adaptive = None;
        }
        out
    }
}
