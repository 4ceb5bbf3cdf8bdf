//! Geometric multigrid V-cycle, used as a PCG preconditioner.
//!
//! Each coarser level keeps every second node of the grid along each axis.
//! Corrections move between levels by multilinear interpolation `P`, and the
//! coarse matrices are Galerkin products `P^T A P` of the fine system, so
//! Neumann, periodic and variable-coefficient rows need no separate
//! discretisation. Damped Jacobi smooths on every level. Dirichlet rows are
//! identity rows and pass straight through.

use std::collections::BTreeMap;

use tracing::debug;

use crate::grid::{Grid, MAX_DIM};
use crate::operator::LinearSystem;

const MAX_LEVELS: usize = 5;
/// Jacobi damping factor.
const DAMPING: f64 = 0.8;
const SMOOTHING_SWEEPS: usize = 2;
const COARSE_SWEEPS: usize = 50;

/// Compressed sparse rows over the unknowns of one level.
#[derive(Debug, Default)]
struct Csr {
    row_start: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
}

impl Csr {
    fn from_rows(rows: &[BTreeMap<usize, f64>]) -> Self {
        let mut csr = Csr {
            row_start: Vec::with_capacity(rows.len() + 1),
            ..Default::default()
        };
        csr.row_start.push(0);
        for row in rows {
            for (&j, &a) in row {
                csr.cols.push(j);
                csr.vals.push(a);
            }
            csr.row_start.push(csr.cols.len());
        }
        csr
    }

    fn len(&self) -> usize {
        self.row_start.len() - 1
    }

    fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_start[i]..self.row_start[i + 1];
        self.cols[span.clone()]
            .iter()
            .copied()
            .zip(self.vals[span].iter().copied())
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        for (i, yi) in y.iter_mut().enumerate() {
            *yi = self.row(i).map(|(j, a)| a * x[j]).sum();
        }
    }

    fn diagonal(&self) -> Vec<f64> {
        (0..self.len())
            .map(|i| self.row(i).find(|(j, _)| *j == i).map_or(0.0, |(_, a)| a))
            .collect()
    }
}

#[derive(Debug)]
struct Level {
    matrix: Csr,
    inv_diag: Vec<f64>,
    /// Interpolation from the next coarser level, one row per unknown here.
    prolongation: Vec<Vec<(usize, f64)>>,
    r: Vec<f64>,
    z: Vec<f64>,
    scratch: Vec<f64>,
}

impl Level {
    fn new(matrix: Csr) -> Self {
        let n = matrix.len();
        let inv_diag = matrix
            .diagonal()
            .into_iter()
            .map(|d| if d.abs() > 1e-30 { 1.0 / d } else { 1.0 })
            .collect();
        Self {
            matrix,
            inv_diag,
            prolongation: Vec::new(),
            r: vec![0.0; n],
            z: vec![0.0; n],
            scratch: vec![0.0; n],
        }
    }

    /// `sweeps` damped Jacobi sweeps on `A z = r`.
    fn smooth(&mut self, sweeps: usize) {
        for _ in 0..sweeps {
            self.matrix.apply(&self.z, &mut self.scratch);
            for i in 0..self.z.len() {
                self.z[i] += DAMPING * (self.r[i] - self.scratch[i]) * self.inv_diag[i];
            }
        }
    }

    /// `scratch = r - A z`
    fn residual(&mut self) {
        self.matrix.apply(&self.z, &mut self.scratch);
        for (s, r) in self.scratch.iter_mut().zip(&self.r) {
            *s = r - *s;
        }
    }
}

/// Multilevel hierarchy built once per system.
#[derive(Debug)]
pub(crate) struct Multigrid {
    /// Row of the system behind each unknown of the finest level.
    unknowns: Vec<usize>,
    levels: Vec<Level>,
}

impl Multigrid {
    pub fn new(system: &LinearSystem) -> Self {
        let mut grid = system.grid().clone();
        let unknowns: Vec<usize> = (0..system.len()).filter(|&i| system.is_unknown(i)).collect();
        let mut local = local_indices(system.len(), &unknowns);

        let rows: Vec<BTreeMap<usize, f64>> = unknowns
            .iter()
            .enumerate()
            .map(|(k, &i)| {
                let mut row = BTreeMap::new();
                row.insert(k, system.diagonal()[i]);
                for &(j, a) in system.row(i) {
                    if let Some(lj) = local[j] {
                        *row.entry(lj).or_insert(0.0) += a;
                    }
                }
                row
            })
            .collect();
        let mut levels = vec![Level::new(Csr::from_rows(&rows))];
        let mut nodes = unknowns.clone();

        while levels.len() < MAX_LEVELS {
            let Some(coarse) = grid.coarsened() else {
                break;
            };
            // A coarse node is an unknown when the fine node under it is.
            let coarse_nodes: Vec<usize> = (0..coarse.len())
                .filter(|&c| {
                    let fine = fine_node(&grid, &coarse, c);
                    local[fine].is_some()
                })
                .collect();
            if coarse_nodes.is_empty() {
                break;
            }
            let coarse_local = local_indices(coarse.len(), &coarse_nodes);
            let prolongation: Vec<Vec<(usize, f64)>> = nodes
                .iter()
                .map(|&i| interpolation_row(&grid, &coarse, i, &coarse_local))
                .collect();

            let Some(fine) = levels.last_mut() else {
                break;
            };
            fine.prolongation = prolongation;
            let matrix = galerkin(&fine.matrix, &fine.prolongation, coarse_nodes.len());
            levels.push(Level::new(matrix));

            grid = coarse;
            local = coarse_local;
            nodes = coarse_nodes;
        }

        debug!(
            levels = levels.len(),
            unknowns = unknowns.len(),
            coarsest = levels.last().map_or(0, |l| l.r.len()),
            "multigrid hierarchy built"
        );
        Self { unknowns, levels }
    }

    /// Number of levels, the finest included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// `z = M^{-1} r` by one V-cycle from a zero initial guess.
    pub fn apply(&mut self, r: &[f64], z: &mut [f64]) {
        z.copy_from_slice(r);
        let Some(top) = self.levels.first_mut() else {
            return;
        };
        for (k, &i) in self.unknowns.iter().enumerate() {
            top.r[k] = r[i];
        }
        let coarse_sweeps = if self.levels.len() > 1 {
            COARSE_SWEEPS
        } else {
            // A single level degrades to one damped Jacobi sweep.
            1
        };
        v_cycle(&mut self.levels, coarse_sweeps);
        let top = &self.levels[0];
        for (k, &i) in self.unknowns.iter().enumerate() {
            z[i] = top.z[k];
        }
    }
}

fn v_cycle(levels: &mut [Level], coarse_sweeps: usize) {
    let Some((level, coarser)) = levels.split_first_mut() else {
        return;
    };
    level.z.fill(0.0);
    let Some(next) = coarser.first_mut() else {
        level.smooth(coarse_sweeps);
        return;
    };

    level.smooth(SMOOTHING_SWEEPS);
    level.residual();
    // Restrict with P^T.
    next.r.fill(0.0);
    for (k, row) in level.prolongation.iter().enumerate() {
        for &(c, w) in row {
            next.r[c] += w * level.scratch[k];
        }
    }
    v_cycle(coarser, coarse_sweeps);
    let correction = &coarser[0].z;
    for (zk, row) in level.z.iter_mut().zip(&level.prolongation) {
        *zk += row.iter().map(|&(c, w)| w * correction[c]).sum::<f64>();
    }
    level.smooth(SMOOTHING_SWEEPS);
}

fn local_indices(len: usize, nodes: &[usize]) -> Vec<Option<usize>> {
    let mut local = vec![None; len];
    for (k, &i) in nodes.iter().enumerate() {
        local[i] = Some(k);
    }
    local
}

/// Fine node lying under coarse node `c`.
fn fine_node(fine: &Grid, coarse: &Grid, c: usize) -> usize {
    let mut ijk = coarse.multi_index(c);
    for v in ijk.iter_mut().take(fine.dim()) {
        *v *= 2;
    }
    fine.flat_index(ijk)
}

/// Multilinear weights of the coarse unknowns around fine node `i`.
fn interpolation_row(
    fine: &Grid,
    coarse: &Grid,
    i: usize,
    coarse_local: &[Option<usize>],
) -> Vec<(usize, f64)> {
    let ijk = fine.multi_index(i);
    let mut row = vec![([0usize; MAX_DIM], 1.0)];
    for (a, &fi) in ijk.iter().enumerate().take(fine.dim()) {
        let nodes = coarse.axis(a).nodes;
        let parents = if fi % 2 == 0 {
            vec![(fi / 2, 1.0)]
        } else {
            vec![((fi - 1) / 2, 0.5), (((fi + 1) / 2) % nodes, 0.5)]
        };
        row = row
            .iter()
            .flat_map(|(idx, w)| {
                parents.iter().map(move |&(p, pw)| {
                    let mut next = *idx;
                    next[a] = p;
                    (next, w * pw)
                })
            })
            .collect();
    }
    row.into_iter()
        .filter_map(|(idx, w)| coarse_local[coarse.flat_index(idx)].map(|c| (c, w)))
        .collect()
}

/// `P^T A P` for a fine matrix `a` and prolongation `p`.
fn galerkin(a: &Csr, p: &[Vec<(usize, f64)>], coarse_len: usize) -> Csr {
    let mut rows = vec![BTreeMap::new(); coarse_len];
    for (i, pi) in p.iter().enumerate() {
        for (j, a_ij) in a.row(i) {
            for &(ci, wi) in pi {
                for &(cj, wj) in &p[j] {
                    *rows[ci].entry(cj).or_insert(0.0) += wi * a_ij * wj;
                }
            }
        }
    }
    Csr::from_rows(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{AxisSpec, BoundaryKind};
    use crate::operator::{Coefficients, Operator, PdeKind};
    use crate::solver::vector::dot;

    fn system(axes: &[AxisSpec], shift: f64) -> LinearSystem {
        let grid = Grid::new(axes).unwrap();
        Operator::build(&grid, PdeKind::Diffusion, &Coefficients::default())
            .unwrap()
            .system(shift, -1.0)
    }

    #[test]
    fn test_depth_follows_grid_halving() {
        let sys = system(&[AxisSpec::unit(16), AxisSpec::unit(16)], 0.0);
        // 16 -> 8 -> 4 -> 2 cells.
        assert_eq!(Multigrid::new(&sys).depth(), 4);
        let sys = system(&[AxisSpec::unit(64)], 0.0);
        assert_eq!(Multigrid::new(&sys).depth(), MAX_LEVELS);
        let sys = system(&[AxisSpec::unit(5), AxisSpec::unit(5)], 0.0);
        assert_eq!(Multigrid::new(&sys).depth(), 1);
    }

    #[test]
    fn test_interpolation_reproduces_constants() {
        let fine = Grid::new(&[AxisSpec::unit(8), AxisSpec::unit(4).periodic()]).unwrap();
        let coarse = fine.coarsened().unwrap();
        let all: Vec<usize> = (0..coarse.len()).collect();
        let local = local_indices(coarse.len(), &all);
        for i in 0..fine.len() {
            let row = interpolation_row(&fine, &coarse, i, &local);
            let total: f64 = row.iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-15, "node {i}: {row:?}");
        }
    }

    #[test]
    fn test_v_cycle_is_symmetric_positive() {
        let axes = [
            AxisSpec::unit(8).with_boundaries(BoundaryKind::Neumann, BoundaryKind::Dirichlet),
            AxisSpec::unit(8).periodic(),
        ];
        let sys = system(&axes, 1.0);
        let n = sys.len();
        let mut mg = Multigrid::new(&sys);
        assert!(mg.depth() > 1);
        let u: Vec<f64> = (0..n).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
        let v: Vec<f64> = (0..n).map(|i| ((i * 3) % 5) as f64 + 0.5).collect();
        let (mut mu, mut mv) = (vec![0.0; n], vec![0.0; n]);
        mg.apply(&u, &mut mu);
        mg.apply(&v, &mut mv);
        let lhs = dot(&v, &mu);
        let rhs = dot(&u, &mv);
        assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0), "{lhs} vs {rhs}");
        assert!(dot(&u, &mu) > 0.0);
    }
}
