use serde::{Deserialize, Serialize};

use crate::error::{PdeError, Result};
use crate::grid::{Grid, MAX_DIM};

/// Scalar values at the nodes of a [`Grid`].
///
/// The field borrows its grid, so the grid must outlive every field defined
/// over it. Coarse and fine fields of a convergence study each borrow their
/// own grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Field<'g> {
    grid: &'g Grid,
    values: Vec<f64>,
}

impl<'g> Field<'g> {
    pub fn zeros(grid: &'g Grid) -> Self {
        Self {
            grid,
            values: vec![0.0; grid.len()],
        }
    }

    /// Sample a function of position at every node.
    pub fn from_fn(grid: &'g Grid, f: impl Fn([f64; MAX_DIM]) -> f64) -> Self {
        let values = (0..grid.len()).map(|i| f(grid.position(i))).collect();
        Self { grid, values }
    }

    pub fn from_values(grid: &'g Grid, values: Vec<f64>) -> Result<Self> {
        if values.len() != grid.len() {
            return Err(PdeError::config(format!(
                "field has {} values but grid has {} nodes",
                values.len(),
                grid.len()
            )));
        }
        Ok(Self { grid, values })
    }

    /// Wrap a vector produced by a solver for this grid.
    pub(crate) fn from_solver(grid: &'g Grid, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), grid.len());
        Self { grid, values }
    }

    pub fn grid(&self) -> &'g Grid {
        self.grid
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max_abs(&self) -> f64 {
        self.values.iter().fold(0.0, |m, v| m.max(v.abs()))
    }
}

/// Owned, serialisable copy of a field at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSample {
    pub step: usize,
    pub time: f64,
    pub values: Vec<f64>,
}

impl FieldSample {
    pub fn new(step: usize, time: f64, field: &Field<'_>) -> Self {
        Self {
            step,
            time,
            values: field.values().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::AxisSpec;

    #[test]
    fn test_from_fn_samples_positions() {
        let grid = Grid::new(&[AxisSpec::unit(4)]).unwrap();
        let field = Field::from_fn(&grid, |x| 2.0 * x[0]);
        assert_eq!(field.len(), 5);
        assert!((field.values()[4] - 2.0).abs() < 1e-15);
        assert!((field.max_abs() - 2.0).abs() < 1e-15);
    }

    #[test]
    fn test_from_values_checks_length() {
        let grid = Grid::new(&[AxisSpec::unit(4)]).unwrap();
        assert!(Field::from_values(&grid, vec![0.0; 4]).is_err());
        assert!(Field::from_values(&grid, vec![0.0; 5]).is_ok());
    }
}
