use serde::{Deserialize, Serialize};

use crate::field::Field;
use crate::grid::Side;

/// Norm used to measure discretisation error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    #[default]
    L2,
    Linf,
}

/// Error of a numerical field against the exact solution on the same grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorNorms {
    /// `sqrt(sum e_i^2 * dV)`
    pub l2: f64,
    pub linf: f64,
    /// `l2` divided by the L2 norm of the exact solution.
    pub relative_l2: f64,
    /// Discrete H1 seminorm from forward differences along each axis.
    pub h1_semi: f64,
}

impl ErrorNorms {
    pub fn compute(numerical: &Field<'_>, exact: &Field<'_>) -> Self {
        let grid = numerical.grid();
        let volume = grid.cell_volume();
        let err: Vec<f64> = numerical
            .values()
            .iter()
            .zip(exact.values())
            .map(|(u, e)| u - e)
            .collect();

        let l2 = (err.iter().map(|e| e * e).sum::<f64>() * volume).sqrt();
        let linf = err.iter().fold(0.0, |m: f64, e| m.max(e.abs()));
        let exact_l2 = (exact.values().iter().map(|e| e * e).sum::<f64>() * volume).sqrt();
        let relative_l2 = if exact_l2 > 0.0 { l2 / exact_l2 } else { l2 };

        let mut grad_sq = 0.0;
        for i in 0..grid.len() {
            for a in 0..grid.dim() {
                if let Some(j) = grid.neighbor(i, a, Side::High) {
                    let d = (err[j] - err[i]) / grid.spacing(a);
                    grad_sq += d * d;
                }
            }
        }
        let h1_semi = (grad_sq * volume).sqrt();

        Self {
            l2,
            linf,
            relative_l2,
            h1_semi,
        }
    }

    pub fn get(&self, kind: NormKind) -> f64 {
        match kind {
            NormKind::L2 => self.l2,
            NormKind::Linf => self.linf,
        }
    }
}
