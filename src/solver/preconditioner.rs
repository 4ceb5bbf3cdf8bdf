use serde::{Deserialize, Serialize};

use super::multigrid::Multigrid;
use crate::operator::LinearSystem;

fn default_omega() -> f64 {
    1.2
}

/// Preconditioner used by the PCG method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PreconditionerKind {
    /// Diagonal scaling.
    #[default]
    Jacobi,
    /// Symmetric successive over-relaxation, `0 < omega < 2`.
    Ssor {
        #[serde(default = "default_omega")]
        omega: f64,
    },
    /// One geometric multigrid V-cycle.
    Multigrid,
}

/// A preconditioner bound to one system. Applying it does not allocate.
#[derive(Debug)]
pub(crate) struct Preconditioner<'s> {
    kind: PreconditionerKind,
    system: &'s LinearSystem,
    multigrid: Option<Multigrid>,
}

impl<'s> Preconditioner<'s> {
    pub fn new(kind: PreconditionerKind, system: &'s LinearSystem) -> Self {
        let multigrid = match kind {
            PreconditionerKind::Multigrid => Some(Multigrid::new(system)),
            _ => None,
        };
        Self {
            kind,
            system,
            multigrid,
        }
    }

    /// `z = M^{-1} r`
    pub fn apply(&mut self, r: &[f64], z: &mut [f64]) {
        let diag = self.system.diagonal();
        match self.kind {
            PreconditionerKind::Jacobi => {
                for i in 0..r.len() {
                    z[i] = if diag[i].abs() > 1e-30 {
                        r[i] / diag[i]
                    } else {
                        r[i]
                    };
                }
            }
            PreconditionerKind::Ssor { omega } => {
                let n = r.len();
                // Forward sweep: (D/omega + L) y = r, then scale by D.
                for i in 0..n {
                    let mut s = r[i];
                    for &(j, a_ij) in self.system.row(i) {
                        if j >= i {
                            break;
                        }
                        s -= a_ij * z[j];
                    }
                    z[i] = s * omega / diag[i];
                }
                for i in 0..n {
                    z[i] *= diag[i];
                }
                // Backward sweep: (D/omega + U) z = D y.
                for i in (0..n).rev() {
                    let mut s = z[i];
                    for &(j, a_ij) in self.system.row(i).iter().rev() {
                        if j <= i {
                            break;
                        }
                        s -= a_ij * z[j];
                    }
                    z[i] = s * omega / diag[i];
                }
                let scale = (2.0 - omega) / omega;
                for zi in z.iter_mut() {
                    *zi *= scale;
                }
            }
            PreconditionerKind::Multigrid => {
                if let Some(mg) = self.multigrid.as_mut() {
                    mg.apply(r, z);
                }
            }
        }
    }
}
