use tracing::trace;

use super::{Coefficients, NeumannTerm, PdeKind};
use crate::grid::{BoundaryKind, Grid, Side};

/// Sparse rows of the discrete operator before they are wrapped into an
/// [`super::Operator`].
#[derive(Debug, Default)]
pub(super) struct Assembly {
    pub unknown: Vec<bool>,
    pub diag: Vec<f64>,
    /// Couplings between unknown nodes.
    pub off: Vec<Vec<(usize, f64)>>,
    /// Couplings from unknown rows to Dirichlet nodes.
    pub boundary: Vec<Vec<(usize, f64)>>,
    pub neumann: Vec<NeumannTerm>,
    /// Row weights that make the Neumann-modified operator symmetric.
    pub weights: Vec<f64>,
    pub kappa_max: f64,
}

/// Smallest face diffusivity allowed after ghost extrapolation, relative to
/// the nodal value.
const GHOST_KAPPA_FLOOR: f64 = 1e-3;

pub(super) fn assemble(grid: &Grid, kind: PdeKind, coeffs: &Coefficients) -> Assembly {
    let n = grid.len();
    let geometry = grid.geometry();

    let kappa: Vec<f64> = match kind {
        PdeKind::Diffusion => vec![coeffs.diffusivity.max_value(); n],
        PdeKind::VariableDiffusion
        | PdeKind::AdvectionDiffusion
        | PdeKind::LimitedAdvectionDiffusion => (0..n)
            .map(|i| coeffs.diffusivity.value(&geometry, grid.position(i)))
            .collect(),
    };
    let velocity = match kind {
        PdeKind::AdvectionDiffusion | PdeKind::LimitedAdvectionDiffusion => coeffs.velocity,
        PdeKind::Diffusion | PdeKind::VariableDiffusion => [0.0; 3],
    };

    let unknown: Vec<bool> = (0..n).map(|i| !grid.is_dirichlet(i)).collect();
    let mut asm = Assembly {
        diag: vec![0.0; n],
        off: vec![Vec::new(); n],
        boundary: vec![Vec::new(); n],
        weights: vec![1.0; n],
        unknown,
        ..Default::default()
    };

    for i in 0..n {
        if !asm.unknown[i] {
            continue;
        }
        for (a, side) in grid.boundary_faces(i) {
            if grid.axis(a).boundary(side) == BoundaryKind::Neumann {
                asm.weights[i] *= 0.5;
            }
        }

        for a in 0..grid.dim() {
            let h = grid.spacing(a);
            let lo = grid.neighbor(i, a, Side::Low);
            let hi = grid.neighbor(i, a, Side::High);

            let face = |j: Option<usize>| j.map(|j| coeffs.averaging.average(kappa[i], kappa[j]));
            let (k_lo, k_hi) = match (face(lo), face(hi)) {
                (Some(l), Some(r)) => (l, r),
                (None, Some(r)) => (ghost_kappa(kappa[i], r), r),
                (Some(l), None) => (l, ghost_kappa(kappa[i], l)),
                // cells >= 2 guarantees at least one neighbour per axis
                (None, None) => (kappa[i], kappa[i]),
            };
            asm.kappa_max = asm.kappa_max.max(k_lo).max(k_hi);

            let mut c_lo = k_lo / (h * h);
            let mut c_hi = k_hi / (h * h);
            let mut c_diag = -(c_lo + c_hi);

            // First-order upwind for -v du/dx.
            let v = velocity[a];
            if v > 0.0 {
                c_lo += v / h;
                c_diag -= v / h;
            } else if v < 0.0 {
                c_hi -= v / h;
                c_diag += v / h;
            }

            asm.diag[i] += c_diag;
            couple(&mut asm, grid, i, a, Side::Low, c_lo);
            couple(&mut asm, grid, i, a, Side::High, c_hi);
        }
    }

    for row in asm.off.iter_mut().chain(asm.boundary.iter_mut()) {
        merge_duplicates(row);
    }

    trace!(
        nodes = n,
        neumann_terms = asm.neumann.len(),
        "assembled {} operator",
        kind
    );
    asm
}

/// Linear extrapolation of the face diffusivity across a Neumann face.
fn ghost_kappa(kappa_node: f64, kappa_inner_face: f64) -> f64 {
    (2.0 * kappa_node - kappa_inner_face).max(GHOST_KAPPA_FLOOR * kappa_node)
}

/// Add `coeff * u[neighbour]` to row `i`, resolving a missing neighbour as a
/// Neumann ghost node `u_ghost = u_opposite + 2 h g`.
fn couple(asm: &mut Assembly, grid: &Grid, i: usize, axis: usize, side: Side, coeff: f64) {
    if coeff == 0.0 {
        return;
    }
    let target = match grid.neighbor(i, axis, side) {
        Some(j) => j,
        None => {
            let Some(j) = grid.neighbor(i, axis, side.opposite()) else {
                return;
            };
            asm.neumann.push(NeumannTerm {
                row: i,
                axis,
                side,
                weight: coeff * 2.0 * grid.spacing(axis),
            });
            j
        }
    };
    if asm.unknown[target] {
        asm.off[i].push((target, coeff));
    } else {
        asm.boundary[i].push((target, coeff));
    }
}

fn merge_duplicates(row: &mut Vec<(usize, f64)>) {
    row.sort_by_key(|(j, _)| *j);
    row.dedup_by(|next, kept| {
        if next.0 == kept.0 {
            kept.1 += next.1;
            true
        } else {
            false
        }
    });
}

/// Check `w_i a_ij == w_j a_ji` for every stored coupling.
pub(super) fn is_weighted_symmetric(asm: &Assembly) -> bool {
    const REL_TOL: f64 = 1e-12;
    for (i, row) in asm.off.iter().enumerate() {
        for &(j, a_ij) in row {
            let a_ji = asm.off[j]
                .binary_search_by_key(&i, |(k, _)| *k)
                .map(|pos| asm.off[j][pos].1)
                .unwrap_or(0.0);
            let lhs = asm.weights[i] * a_ij;
            let rhs = asm.weights[j] * a_ji;
            if (lhs - rhs).abs() > REL_TOL * lhs.abs().max(rhs.abs()) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_duplicates_sums_entries() {
        let mut row = vec![(3, 1.0), (1, 2.0), (3, 0.5)];
        merge_duplicates(&mut row);
        assert_eq!(row, vec![(1, 2.0), (3, 1.5)]);
    }

    #[test]
    fn test_ghost_kappa_extrapolates_and_floors() {
        assert!((ghost_kappa(1.0, 0.8) - 1.2).abs() < 1e-15);
        assert!((ghost_kappa(1.0, 5.0) - GHOST_KAPPA_FLOOR).abs() < 1e-15);
    }
}
