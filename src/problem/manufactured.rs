//! Manufactured solutions with closed-form derivatives.
//!
//! Every solution is separable, `u(x, t) = T(t) * prod_a phi_a(xi_a)`, with
//! `xi = (x - origin) / length` the normalised coordinate. The forcing that
//! makes `u` exact is derived from the analytic derivatives.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::Forcing;
use crate::error::{PdeError, Result};
use crate::field::Field;
use crate::grid::{Geometry, Grid, MAX_DIM, Side};

fn default_modes() -> u32 {
    1
}

/// Closed set of manufactured solutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ManufacturedSolution {
    /// `u = xi_0`. Steady, reproduced exactly by second-order stencils.
    Linear,
    /// `u = e^{-t} prod sin(m pi xi_a)`. Vanishes on every face.
    SineProduct {
        #[serde(default = "default_modes")]
        modes: u32,
    },
    /// `u = e^{-t} prod cos(m pi xi_a)`. Zero normal derivative on every face.
    CosineProduct {
        #[serde(default = "default_modes")]
        modes: u32,
    },
    /// `u = e^{-t} prod (1 + xi_a)`. Exact in space, used for temporal studies.
    Bilinear,
}

/// Value and derivatives of a solution at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    pub time_derivative: f64,
    pub gradient: [f64; MAX_DIM],
    pub laplacian: f64,
}

impl ManufacturedSolution {
    pub fn name(&self) -> &'static str {
        match self {
            ManufacturedSolution::Linear => "linear",
            ManufacturedSolution::SineProduct { .. } => "sine-product",
            ManufacturedSolution::CosineProduct { .. } => "cosine-product",
            ManufacturedSolution::Bilinear => "bilinear",
        }
    }

    /// `(T, T')` at time `t`.
    fn time_factor(&self, t: f64) -> (f64, f64) {
        match self {
            ManufacturedSolution::Linear => (1.0, 0.0),
            _ => {
                let e = (-t).exp();
                (e, -e)
            }
        }
    }

    /// `(phi, phi', phi'')` with derivatives taken in the normalised coordinate.
    fn axis_factor(&self, axis: usize, xi: f64) -> (f64, f64, f64) {
        match *self {
            ManufacturedSolution::Linear if axis == 0 => (xi, 1.0, 0.0),
            ManufacturedSolution::Linear => (1.0, 0.0, 0.0),
            ManufacturedSolution::SineProduct { modes } => {
                let w = modes as f64 * PI;
                let (s, c) = (w * xi).sin_cos();
                (s, w * c, -w * w * s)
            }
            ManufacturedSolution::CosineProduct { modes } => {
                let w = modes as f64 * PI;
                let (s, c) = (w * xi).sin_cos();
                (c, -w * s, -w * w * c)
            }
            ManufacturedSolution::Bilinear => (1.0 + xi, 1.0, 0.0),
        }
    }

    pub fn evaluate(&self, geometry: &Geometry, x: [f64; MAX_DIM], t: f64) -> Evaluation {
        let xi = geometry.normalized(x);
        let dim = geometry.dim;
        let mut phi = [1.0; MAX_DIM];
        let mut dphi = [0.0; MAX_DIM];
        let mut d2phi = [0.0; MAX_DIM];
        for a in 0..dim {
            let (p, dp, d2p) = self.axis_factor(a, xi[a]);
            let l = geometry.length[a];
            phi[a] = p;
            dphi[a] = dp / l;
            d2phi[a] = d2p / (l * l);
        }

        let others = |skip: usize| -> f64 {
            (0..dim).filter(|&b| b != skip).map(|b| phi[b]).product()
        };

        let (tf, dtf) = self.time_factor(t);
        let space: f64 = phi[..dim].iter().product();
        let mut gradient = [0.0; MAX_DIM];
        let mut laplacian = 0.0;
        for a in 0..dim {
            let rest = others(a);
            gradient[a] = tf * dphi[a] * rest;
            laplacian += tf * d2phi[a] * rest;
        }

        Evaluation {
            value: tf * space,
            time_derivative: dtf * space,
            gradient,
            laplacian,
        }
    }
}

/// Diffusion coefficient as a function of position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Diffusivity {
    Constant(f64),
    /// `kappa = base * (1 + amplitude * prod sin(2 pi xi_a))`.
    Sinusoidal { base: f64, amplitude: f64 },
}

impl Default for Diffusivity {
    fn default() -> Self {
        Diffusivity::Constant(1.0)
    }
}

impl Diffusivity {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Diffusivity::Constant(k) if k.is_finite() && k > 0.0 => Ok(()),
            Diffusivity::Constant(k) => Err(PdeError::config(format!(
                "diffusivity must be positive, got {k}"
            ))),
            Diffusivity::Sinusoidal { base, amplitude }
                if base.is_finite() && base > 0.0 && amplitude.abs() < 1.0 =>
            {
                Ok(())
            }
            Diffusivity::Sinusoidal { base, amplitude } => Err(PdeError::config(format!(
                "sinusoidal diffusivity needs base > 0 and |amplitude| < 1, got base={base} amplitude={amplitude}"
            ))),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Diffusivity::Constant(_))
    }

    pub fn value(&self, geometry: &Geometry, x: [f64; MAX_DIM]) -> f64 {
        match *self {
            Diffusivity::Constant(k) => k,
            Diffusivity::Sinusoidal { base, amplitude } => {
                let xi = geometry.normalized(x);
                let s: f64 = (0..geometry.dim).map(|a| (2.0 * PI * xi[a]).sin()).product();
                base * (1.0 + amplitude * s)
            }
        }
    }

    pub fn gradient(&self, geometry: &Geometry, x: [f64; MAX_DIM]) -> [f64; MAX_DIM] {
        let mut g = [0.0; MAX_DIM];
        if let Diffusivity::Sinusoidal { base, amplitude } = *self {
            let xi = geometry.normalized(x);
            for a in 0..geometry.dim {
                let rest: f64 = (0..geometry.dim)
                    .filter(|&b| b != a)
                    .map(|b| (2.0 * PI * xi[b]).sin())
                    .product();
                let w = 2.0 * PI / geometry.length[a];
                g[a] = base * amplitude * w * (2.0 * PI * xi[a]).cos() * rest;
            }
        }
        g
    }

    /// Upper bound of the coefficient over the domain.
    pub fn max_value(&self) -> f64 {
        match *self {
            Diffusivity::Constant(k) => k,
            Diffusivity::Sinusoidal { base, amplitude } => base * (1.0 + amplitude.abs()),
        }
    }
}

/// A manufactured solution together with the coefficients of the equation
/// `u_t = div(kappa grad u) - v . grad u + f`.
///
/// In steady mode the solution is frozen at `t = 0` and the source is
/// `f = -L u`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManufacturedProblem {
    pub solution: ManufacturedSolution,
    pub diffusivity: Diffusivity,
    pub velocity: [f64; MAX_DIM],
    pub geometry: Geometry,
    pub steady: bool,
}

impl ManufacturedProblem {
    fn time(&self, t: f64) -> f64 {
        if self.steady { 0.0 } else { t }
    }

    pub fn exact(&self, x: [f64; MAX_DIM], t: f64) -> f64 {
        self.solution.evaluate(&self.geometry, x, self.time(t)).value
    }

    pub fn exact_field<'g>(&self, grid: &'g Grid, t: f64) -> Field<'g> {
        Field::from_fn(grid, |x| self.exact(x, t))
    }

    /// `L u = kappa lap(u) + grad(kappa) . grad(u) - v . grad(u)` for the exact solution.
    pub fn exact_operator(&self, x: [f64; MAX_DIM], t: f64) -> f64 {
        let e = self.solution.evaluate(&self.geometry, x, self.time(t));
        let kappa = self.diffusivity.value(&self.geometry, x);
        let dk = self.diffusivity.gradient(&self.geometry, x);
        let mut lu = kappa * e.laplacian;
        for a in 0..self.geometry.dim {
            lu += (dk[a] - self.velocity[a]) * e.gradient[a];
        }
        lu
    }
}

impl Forcing for ManufacturedProblem {
    fn source(&self, x: [f64; MAX_DIM], t: f64) -> f64 {
        let lu = self.exact_operator(x, t);
        if self.steady {
            -lu
        } else {
            let e = self.solution.evaluate(&self.geometry, x, t);
            e.time_derivative - lu
        }
    }

    fn dirichlet(&self, x: [f64; MAX_DIM], t: f64) -> f64 {
        self.exact(x, t)
    }

    fn neumann(&self, x: [f64; MAX_DIM], t: f64, axis: usize, side: Side) -> f64 {
        let e = self.solution.evaluate(&self.geometry, x, self.time(t));
        side.normal_sign() * e.gradient[axis]
    }
}
