//! Discrete spatial operators on a structured grid.
//!
//! The builder turns a grid, a PDE tag and coefficients into the linear
//! stencil `L_h` plus an affine Neumann term, so that the discrete operator
//! applied to a field is `L_h u + c(g)`. Dirichlet nodes are not unknowns:
//! their rows are left out of `L_h` and their couplings are kept apart so a
//! solver can lift them into the right-hand side.
//!
//! The limited advection operator is nonlinear. Its [`Operator::system`] is
//! the first-order upwind linearisation, and callers add the limiter
//! correction on the right-hand side.

mod limiter;
mod stencil;
mod system;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PdeError, Result};
use crate::field::Field;
use crate::grid::{Grid, MAX_DIM, Side};
use crate::problem::Diffusivity;

pub use system::LinearSystem;

/// Closed set of supported governing operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdeKind {
    /// `kappa lap(u)` with constant `kappa`.
    Diffusion,
    /// `div(kappa(x) grad u)` in flux form.
    VariableDiffusion,
    /// `div(kappa grad u) - v . grad u` with first-order upwinding.
    AdvectionDiffusion,
    /// As [`PdeKind::AdvectionDiffusion`], with minmod-limited upwind slopes
    /// so that advected profiles stay free of new extrema.
    LimitedAdvectionDiffusion,
}

impl PdeKind {
    pub const ALL: [PdeKind; 4] = [
        PdeKind::Diffusion,
        PdeKind::VariableDiffusion,
        PdeKind::AdvectionDiffusion,
        PdeKind::LimitedAdvectionDiffusion,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            PdeKind::Diffusion => "diffusion",
            PdeKind::VariableDiffusion => "variable-diffusion",
            PdeKind::AdvectionDiffusion => "advection-diffusion",
            PdeKind::LimitedAdvectionDiffusion => "limited-advection-diffusion",
        }
    }

    /// Whether the operator takes a velocity.
    pub fn has_advection(self) -> bool {
        matches!(self, PdeKind::AdvectionDiffusion | PdeKind::LimitedAdvectionDiffusion)
    }

    /// Formal spatial order of accuracy of the stencil. The limiter falls
    /// back to first order at extrema.
    pub fn spatial_order(self) -> f64 {
        match self {
            PdeKind::Diffusion | PdeKind::VariableDiffusion => 2.0,
            PdeKind::AdvectionDiffusion | PdeKind::LimitedAdvectionDiffusion => 1.0,
        }
    }
}

impl fmt::Display for PdeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for PdeKind {
    type Err = PdeError;

    fn from_str(tag: &str) -> Result<Self> {
        PdeKind::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| PdeError::UnsupportedOperator(tag.to_string()))
    }
}

/// How nodal diffusivities are combined on the face between two nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceAveraging {
    #[default]
    Arithmetic,
    Harmonic,
}

impl FaceAveraging {
    pub fn average(self, a: f64, b: f64) -> f64 {
        match self {
            FaceAveraging::Arithmetic => 0.5 * (a + b),
            FaceAveraging::Harmonic => 2.0 * a * b / (a + b),
        }
    }
}

/// Physical coefficients of the operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub diffusivity: Diffusivity,
    pub velocity: [f64; MAX_DIM],
    pub averaging: FaceAveraging,
}

impl Default for Coefficients {
    fn default() -> Self {
        Self {
            diffusivity: Diffusivity::default(),
            velocity: [0.0; MAX_DIM],
            averaging: FaceAveraging::default(),
        }
    }
}

/// Affine contribution of one Neumann ghost node: `weight * g` added to `row`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NeumannTerm {
    pub row: usize,
    pub axis: usize,
    pub side: Side,
    pub weight: f64,
}

/// Assembled discrete operator. Immutable and reusable across applications.
#[derive(Debug, Clone)]
pub struct Operator {
    kind: PdeKind,
    unknown: Vec<bool>,
    diag: Vec<f64>,
    off: Vec<Vec<(usize, f64)>>,
    boundary: Vec<Vec<(usize, f64)>>,
    neumann: Vec<NeumannTerm>,
    weights: Vec<f64>,
    symmetric: bool,
    kappa_max: f64,
    velocity: [f64; MAX_DIM],
    limiter: Option<limiter::SlopeLimiter>,
    grid: Grid,
    positions: Vec<[f64; MAX_DIM]>,
}

impl Operator {
    /// Assemble the operator for `kind` on `grid`.
    pub fn build(grid: &Grid, kind: PdeKind, coeffs: &Coefficients) -> Result<Self> {
        coeffs.diffusivity.validate()?;
        if kind == PdeKind::Diffusion && !coeffs.diffusivity.is_constant() {
            return Err(PdeError::config(
                "diffusion requires a constant diffusivity; use variable-diffusion",
            ));
        }
        if !kind.has_advection() && coeffs.velocity.iter().any(|v| *v != 0.0) {
            return Err(PdeError::config(format!(
                "{kind} does not take a velocity; use advection-diffusion"
            )));
        }
        if coeffs.velocity.iter().any(|v| !v.is_finite()) {
            return Err(PdeError::config("velocity must be finite"));
        }

        let asm = stencil::assemble(grid, kind, coeffs);
        let symmetric = stencil::is_weighted_symmetric(&asm);
        debug!(
            %kind,
            nodes = grid.len(),
            unknowns = asm.unknown.iter().filter(|u| **u).count(),
            symmetric,
            "operator built"
        );

        let velocity = match kind {
            PdeKind::AdvectionDiffusion | PdeKind::LimitedAdvectionDiffusion => coeffs.velocity,
            PdeKind::Diffusion | PdeKind::VariableDiffusion => [0.0; MAX_DIM],
        };
        let limited = kind == PdeKind::LimitedAdvectionDiffusion;
        let limiter = if limited && velocity.iter().any(|v| *v != 0.0) {
            Some(limiter::SlopeLimiter::new(grid, velocity))
        } else {
            None
        };
        Ok(Self {
            kind,
            unknown: asm.unknown,
            diag: asm.diag,
            off: asm.off,
            boundary: asm.boundary,
            neumann: asm.neumann,
            weights: asm.weights,
            symmetric,
            kappa_max: asm.kappa_max,
            velocity,
            limiter,
            grid: grid.clone(),
            positions: (0..grid.len()).map(|i| grid.position(i)).collect(),
        })
    }

    pub fn kind(&self) -> PdeKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    /// True if node `i` is an unknown, false if it carries a Dirichlet value.
    pub fn is_unknown(&self, i: usize) -> bool {
        self.unknown[i]
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown.iter().filter(|u| **u).count()
    }

    /// Whether the row-weighted operator is symmetric. Holds for diffusion
    /// with Dirichlet, periodic and constant-coefficient Neumann faces.
    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    /// False for the limited advection operator.
    pub fn is_linear(&self) -> bool {
        self.limiter.is_none()
    }

    /// Largest explicit Euler step for which the scheme stays stable:
    /// `1 / (2 kappa_max sum 1/h^2 + sum |v_a| / h_a)`. The limited operator
    /// counts the advective term twice, the TVD bound for limited slopes.
    pub fn explicit_step_limit(&self) -> f64 {
        let spacing = || self.grid.axes().iter().map(|a| a.spacing);
        let diffusive: f64 = spacing().map(|h| 1.0 / (h * h)).sum();
        let mut advective: f64 = spacing()
            .zip(&self.velocity)
            .map(|(h, v)| v.abs() / h)
            .sum();
        if self.limiter.is_some() {
            advective *= 2.0;
        }
        1.0 / (2.0 * self.kappa_max * diffusive + advective)
    }

    /// Apply `L_h u`, including the limiter correction for the limited
    /// operator. Dirichlet rows are set to zero; the values stored at
    /// Dirichlet nodes of `u` enter through the couplings.
    pub fn apply_slice(&self, u: &[f64], out: &mut [f64]) {
        for i in 0..self.diag.len() {
            if !self.unknown[i] {
                out[i] = 0.0;
                continue;
            }
            let mut sum = self.diag[i] * u[i];
            for (j, a_ij) in self.off[i].iter().chain(&self.boundary[i]) {
                sum += a_ij * u[*j];
            }
            out[i] = sum;
        }
        self.add_limiter_correction(u, out);
    }

    /// Add `L_h u - L_up u`, the part of the limited operator that
    /// [`Operator::system`] leaves out. A no-op for linear operators.
    pub fn add_limiter_correction(&self, u: &[f64], out: &mut [f64]) {
        if let Some(limiter) = &self.limiter {
            limiter.add_correction(u, &self.unknown, out);
        }
    }

    pub fn apply(&self, u: &Field<'_>, out: &mut Field<'_>) {
        self.apply_slice(u.values(), out.values_mut());
    }

    /// Add the Neumann affine term `c(g)` to `out`. `flux` returns the
    /// outward normal derivative at a node position for a face.
    pub fn add_boundary_term(
        &self,
        mut flux: impl FnMut([f64; MAX_DIM], usize, Side) -> f64,
        out: &mut [f64],
    ) {
        for term in &self.neumann {
            out[term.row] += term.weight * flux(self.positions[term.row], term.axis, term.side);
        }
    }

    /// Build `A = shift * I + scale * L_h` on unknown rows and identity on
    /// Dirichlet rows, row-weighted so that symmetric operators stay symmetric.
    /// For the limited operator `L_h` here is its upwind linearisation.
    pub fn system(&self, shift: f64, scale: f64) -> LinearSystem {
        let n = self.diag.len();
        let mut diag = vec![1.0; n];
        let mut off = vec![Vec::new(); n];
        let mut boundary = vec![Vec::new(); n];
        let mut weights = vec![1.0; n];
        for i in 0..n {
            if !self.unknown[i] {
                continue;
            }
            let w = self.weights[i];
            weights[i] = w;
            diag[i] = w * (shift + scale * self.diag[i]);
            off[i] = self.off[i].iter().map(|&(j, a)| (j, w * scale * a)).collect();
            boundary[i] = self.boundary[i]
                .iter()
                .map(|&(j, a)| (j, w * scale * a))
                .collect();
        }
        LinearSystem::new(
            diag,
            off,
            boundary,
            weights,
            self.unknown.clone(),
            self.symmetric,
            self.grid.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{AxisSpec, BoundaryKind};
    use crate::problem::{Forcing, ManufacturedProblem, ManufacturedSolution};
    use proptest::prelude::*;

    fn coeffs(kappa: f64) -> Coefficients {
        Coefficients {
            diffusivity: Diffusivity::Constant(kappa),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let err = "wave".parse::<PdeKind>().unwrap_err();
        assert!(matches!(err, PdeError::UnsupportedOperator(ref t) if t == "wave"), "{err}");
        for kind in PdeKind::ALL {
            assert_eq!(kind.tag().parse::<PdeKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_second_difference_1d() {
        let grid = Grid::new(&[AxisSpec::unit(4)]).unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &coeffs(1.0)).unwrap();
        assert_eq!(op.unknown_count(), 3);
        assert!(op.is_symmetric());

        // u = x^2 has u'' = 2 everywhere, reproduced exactly.
        let u: Vec<f64> = (0..5).map(|i| (i as f64 * 0.25).powi(2)).collect();
        let mut out = vec![0.0; 5];
        op.apply_slice(&u, &mut out);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[4], 0.0);
        for v in &out[1..4] {
            assert!((v - 2.0).abs() < 1e-12, "L u = {v}");
        }
    }

    #[test]
    fn test_neumann_ghost_reproduces_quadratic() {
        let grid = Grid::new(&[
            AxisSpec::unit(4).with_boundaries(BoundaryKind::Neumann, BoundaryKind::Dirichlet)
        ])
        .unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &coeffs(1.0)).unwrap();
        assert_eq!(op.unknown_count(), 4);
        assert!(op.is_symmetric());

        // u = (1 + x)^2: outward derivative at x=0 is -2, u'' = 2.
        let u: Vec<f64> = (0..5).map(|i| (1.0 + i as f64 * 0.25).powi(2)).collect();
        let mut out = vec![0.0; 5];
        op.apply_slice(&u, &mut out);
        op.add_boundary_term(|_, _, _| -2.0, &mut out);
        for v in &out[0..4] {
            assert!((v - 2.0).abs() < 1e-12, "L u = {v}");
        }
    }

    #[test]
    fn test_periodic_operator_annihilates_constants() {
        let axes = [AxisSpec::unit(6).periodic(), AxisSpec::unit(2).periodic()];
        let grid = Grid::new(&axes).unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &coeffs(2.0)).unwrap();
        assert_eq!(op.unknown_count(), grid.len());
        let u = vec![3.5; grid.len()];
        let mut out = vec![1.0; grid.len()];
        op.apply_slice(&u, &mut out);
        assert!(out.iter().all(|v| v.abs() < 1e-12), "{out:?}");
    }

    #[test]
    fn test_upwind_makes_operator_nonsymmetric() {
        let grid = Grid::new(&[AxisSpec::unit(8), AxisSpec::unit(8)]).unwrap();
        let c = Coefficients {
            velocity: [1.0, -0.5, 0.0],
            ..coeffs(1.0)
        };
        let op = Operator::build(&grid, PdeKind::AdvectionDiffusion, &c).unwrap();
        assert!(!op.is_symmetric());
        let err = Operator::build(&grid, PdeKind::Diffusion, &c).unwrap_err();
        assert!(matches!(err, PdeError::Configuration(_)));
    }

    #[test]
    fn test_explicit_step_limit() {
        let grid = Grid::new(&[AxisSpec::unit(10), AxisSpec::unit(5)]).unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &coeffs(0.5)).unwrap();
        let expected = 1.0 / (2.0 * 0.5 * (100.0 + 25.0));
        assert!((op.explicit_step_limit() - expected).abs() < 1e-15);

        let c = Coefficients {
            velocity: [2.0, 0.0, 0.0],
            ..coeffs(0.5)
        };
        let op = Operator::build(&grid, PdeKind::AdvectionDiffusion, &c).unwrap();
        let expected = 1.0 / (2.0 * 0.5 * 125.0 + 2.0 * 10.0);
        assert!((op.explicit_step_limit() - expected).abs() < 1e-15);
    }

    #[test]
    fn test_limited_operator_linearises_to_upwind() {
        let grid = Grid::new(&[AxisSpec::unit(10), AxisSpec::unit(5)]).unwrap();
        let c = Coefficients {
            velocity: [2.0, -1.0, 0.0],
            ..coeffs(0.5)
        };
        let limited = Operator::build(&grid, PdeKind::LimitedAdvectionDiffusion, &c).unwrap();
        let upwind = Operator::build(&grid, PdeKind::AdvectionDiffusion, &c).unwrap();
        assert!(!limited.is_linear());
        assert!(upwind.is_linear());
        let expected = 1.0 / (2.0 * 0.5 * 125.0 + 2.0 * (20.0 + 5.0));
        assert!((limited.explicit_step_limit() - expected).abs() < 1e-15);

        let u: Vec<f64> = (0..grid.len()).map(|i| ((i * 5) % 7) as f64).collect();
        let (mut a, mut b) = (vec![0.0; grid.len()], vec![0.0; grid.len()]);
        limited.system(1.0, -0.1).apply(&u, &mut a);
        upwind.system(1.0, -0.1).apply(&u, &mut b);
        assert_eq!(a, b);

        // Without velocity there is nothing to limit.
        let still = Operator::build(&grid, PdeKind::LimitedAdvectionDiffusion, &coeffs(0.5));
        assert!(still.unwrap().is_linear());
    }

    #[test]
    fn test_limited_front_stays_bounded_and_sharp() {
        let grid = Grid::new(&[AxisSpec::unit(64)]).unwrap();
        let c = Coefficients {
            velocity: [1.0, 0.0, 0.0],
            ..coeffs(1e-3)
        };
        let transported = |kind| {
            let op = Operator::build(&grid, kind, &c).unwrap();
            let limited = Operator::build(&grid, PdeKind::LimitedAdvectionDiffusion, &c).unwrap();
            let dt = 0.9 * limited.explicit_step_limit();
            let mut u: Vec<f64> = (0..grid.len())
                .map(|i| if grid.position(i)[0] < 0.25 { 1.0 } else { 0.0 })
                .collect();
            let mut lu = vec![0.0; grid.len()];
            for _ in 0..40 {
                op.apply_slice(&u, &mut lu);
                for (ui, l) in u.iter_mut().zip(&lu) {
                    *ui += dt * l;
                }
            }
            u
        };
        let smeared = |u: &[f64]| u.iter().filter(|v| **v > 0.05 && **v < 0.95).count();

        let limited = transported(PdeKind::LimitedAdvectionDiffusion);
        for v in &limited {
            assert!((-1e-12..=1.0 + 1e-12).contains(v), "new extremum {v}");
        }
        let upwind = transported(PdeKind::AdvectionDiffusion);
        assert!(
            smeared(&limited) < smeared(&upwind),
            "{} vs {}",
            smeared(&limited),
            smeared(&upwind)
        );
    }

    #[test]
    fn test_system_is_identity_on_dirichlet_rows() {
        let grid = Grid::new(&[AxisSpec::unit(4)]).unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &coeffs(1.0)).unwrap();
        let sys = op.system(1.0, -0.1);
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let mut y = vec![0.0; 5];
        sys.apply(&x, &mut y);
        assert_eq!(y[0], 1.0);
        assert_eq!(y[4], 5.0);
        // Interior row 1 couples only to unknown neighbours.
        let h2 = 1.0 / 16.0;
        let expected = 2.0 * (1.0 + 0.1 * 2.0 / h2) - 0.1 / h2 * 3.0;
        assert!((y[1] - expected).abs() < 1e-12, "{} vs {}", y[1], expected);
    }

    fn consistency_error(
        cells: usize,
        kind: PdeKind,
        problem_of: impl Fn(&Grid) -> (Coefficients, ManufacturedProblem),
        axes: impl Fn(usize) -> Vec<AxisSpec>,
    ) -> f64 {
        let grid = Grid::new(&axes(cells)).unwrap();
        let (c, mp) = problem_of(&grid);
        let op = Operator::build(&grid, kind, &c).unwrap();
        let u = mp.exact_field(&grid, 0.0);
        let mut lu = vec![0.0; grid.len()];
        op.apply_slice(u.values(), &mut lu);
        op.add_boundary_term(|x, a, s| mp.neumann(x, 0.0, a, s), &mut lu);
        (0..grid.len())
            .filter(|&i| op.is_unknown(i))
            .map(|i| (lu[i] - mp.exact_operator(grid.position(i), 0.0)).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_truncation_error_decreases_with_refinement() {
        let axes = |cells: usize| {
            vec![
                AxisSpec::unit(cells)
                    .with_boundaries(BoundaryKind::Neumann, BoundaryKind::Dirichlet),
                AxisSpec::unit(cells),
            ]
        };
        let setup = |grid: &Grid| {
            let c = Coefficients {
                diffusivity: Diffusivity::Sinusoidal {
                    base: 1.0,
                    amplitude: 0.4,
                },
                velocity: [0.7, 0.3, 0.0],
                averaging: FaceAveraging::Harmonic,
            };
            let mp = ManufacturedProblem {
                solution: ManufacturedSolution::SineProduct { modes: 1 },
                diffusivity: c.diffusivity,
                velocity: c.velocity,
                geometry: grid.geometry(),
                steady: true,
            };
            (c, mp)
        };
        let coarse = consistency_error(8, PdeKind::AdvectionDiffusion, setup, axes);
        let medium = consistency_error(16, PdeKind::AdvectionDiffusion, setup, axes);
        let fine = consistency_error(32, PdeKind::AdvectionDiffusion, setup, axes);
        assert!(medium < coarse, "coarse={coarse} medium={medium}");
        assert!(fine < medium, "medium={medium} fine={fine}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_operator_is_linear(
            cells in 2usize..9,
            alpha in -3.0f64..3.0,
            seed in prop::collection::vec(-1.0f64..1.0, 2 * 81),
        ) {
            let grid = Grid::new(&[
                AxisSpec::unit(cells).with_boundaries(BoundaryKind::Neumann, BoundaryKind::Neumann),
                AxisSpec::unit(cells),
            ]).unwrap();
            let c = Coefficients {
                diffusivity: Diffusivity::Sinusoidal { base: 1.0, amplitude: 0.3 },
                velocity: [0.5, 0.0, 0.0],
                averaging: FaceAveraging::Arithmetic,
            };
            let op = Operator::build(&grid, PdeKind::AdvectionDiffusion, &c).unwrap();
            let n = grid.len();
            let u = &seed[..n];
            let v = &seed[81..81 + n];
            let combo: Vec<f64> = u.iter().zip(v).map(|(a, b)| a + alpha * b).collect();
            let (mut lu, mut lv, mut lc) = (vec![0.0; n], vec![0.0; n], vec![0.0; n]);
            op.apply_slice(u, &mut lu);
            op.apply_slice(v, &mut lv);
            op.apply_slice(&combo, &mut lc);
            for i in 0..n {
                let expected = lu[i] + alpha * lv[i];
                prop_assert!((lc[i] - expected).abs() <= 1e-9 * (1.0 + expected.abs()));
            }
        }
    }
}
