use crate::grid::Grid;

/// Row-weighted sparse system `W A x = W b` with Dirichlet rows eliminated.
///
/// Dirichlet rows are identity rows and their couplings to unknown rows are
/// moved to the right-hand side by [`LinearSystem::lift`], so the matrix seen
/// by a Krylov method keeps the symmetry of the underlying stencil.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    diag: Vec<f64>,
    off: Vec<Vec<(usize, f64)>>,
    boundary: Vec<Vec<(usize, f64)>>,
    weights: Vec<f64>,
    unknown: Vec<bool>,
    symmetric: bool,
    /// Grid the rows belong to, for geometric preconditioners.
    grid: Grid,
}

impl LinearSystem {
    pub(super) fn new(
        diag: Vec<f64>,
        off: Vec<Vec<(usize, f64)>>,
        boundary: Vec<Vec<(usize, f64)>>,
        weights: Vec<f64>,
        unknown: Vec<bool>,
        symmetric: bool,
        grid: Grid,
    ) -> Self {
        Self {
            diag,
            off,
            boundary,
            weights,
            unknown,
            symmetric,
            grid,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn diagonal(&self) -> &[f64] {
        &self.diag
    }

    /// Off-diagonal entries of row `i` among unknowns, sorted by column.
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.off[i]
    }

    pub fn is_unknown(&self, i: usize) -> bool {
        self.unknown[i]
    }

    /// `y = A x` with Dirichlet columns removed.
    pub fn apply(&self, x: &[f64], y: &mut [f64]) {
        for i in 0..self.diag.len() {
            let mut sum = self.diag[i] * x[i];
            for (j, a_ij) in &self.off[i] {
                sum += a_ij * x[*j];
            }
            y[i] = sum;
        }
    }

    /// Turn a full right-hand side into the one the homogeneous system solves.
    ///
    /// `rhs` holds the equation right-hand side on unknown rows and the
    /// prescribed value on Dirichlet rows.
    pub fn lift(&self, rhs: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; rhs.len()];
        for i in 0..self.diag.len() {
            if !self.unknown[i] {
                out[i] = rhs[i];
                continue;
            }
            let mut b = self.weights[i] * rhs[i];
            for (j, a_ij) in &self.boundary[i] {
                b -= a_ij * rhs[*j];
            }
            out[i] = b;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::grid::{AxisSpec, Grid};
    use crate::operator::{Coefficients, Operator, PdeKind};

    #[test]
    fn test_lift_moves_dirichlet_values_to_rhs() {
        let grid = Grid::new(&[AxisSpec::unit(2)]).unwrap();
        let op = Operator::build(&grid, PdeKind::Diffusion, &Coefficients::default()).unwrap();
        let sys = op.system(0.0, -1.0);
        // -u'' = 0 with u(0) = 1, u(1) = 3; h = 0.5 so the middle row reads
        // 8 u1 = 4 * (1 + 3).
        let b = sys.lift(&[1.0, 0.0, 3.0]);
        assert_eq!(b[0], 1.0);
        assert_eq!(b[2], 3.0);
        assert!((b[1] - 16.0).abs() < 1e-12, "b1={}", b[1]);
        assert!((sys.diagonal()[1] - 8.0).abs() < 1e-12);
        assert!(sys.row(1).is_empty());
    }
}
