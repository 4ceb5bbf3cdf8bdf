use serde::{Deserialize, Serialize};

use crate::error::{PdeError, Result};

/// Maximum number of spatial dimensions.
pub const MAX_DIM: usize = 3;

/// Boundary condition type attached to one face of the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryKind {
    /// Prescribed value.
    Dirichlet,
    /// Prescribed outward normal derivative.
    Neumann,
    /// Wraps to the opposite face. Must be set on both faces of an axis.
    Periodic,
}

/// Low or high end of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Low,
    High,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Low => Side::High,
            Side::High => Side::Low,
        }
    }

    /// Sign of the outward normal along the axis.
    pub fn normal_sign(self) -> f64 {
        match self {
            Side::Low => -1.0,
            Side::High => 1.0,
        }
    }
}

fn default_length() -> f64 {
    1.0
}

fn default_boundary() -> BoundaryKind {
    BoundaryKind::Dirichlet
}

/// Description of one axis as it appears in a problem file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Number of cells along the axis.
    pub cells: usize,
    #[serde(default = "default_length")]
    pub length: f64,
    #[serde(default)]
    pub origin: f64,
    #[serde(default = "default_boundary")]
    pub low: BoundaryKind,
    #[serde(default = "default_boundary")]
    pub high: BoundaryKind,
}

impl AxisSpec {
    /// Unit-length axis with Dirichlet faces.
    pub fn unit(cells: usize) -> Self {
        Self {
            cells,
            length: 1.0,
            origin: 0.0,
            low: BoundaryKind::Dirichlet,
            high: BoundaryKind::Dirichlet,
        }
    }

    pub fn with_boundaries(mut self, low: BoundaryKind, high: BoundaryKind) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    pub fn periodic(self) -> Self {
        self.with_boundaries(BoundaryKind::Periodic, BoundaryKind::Periodic)
    }
}

/// A validated axis of a [`Grid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    pub cells: usize,
    pub length: f64,
    pub origin: f64,
    pub spacing: f64,
    /// Stored nodes: `cells + 1`, or `cells` when periodic.
    pub nodes: usize,
    pub low: BoundaryKind,
    pub high: BoundaryKind,
}

impl Axis {
    pub fn is_periodic(&self) -> bool {
        self.low == BoundaryKind::Periodic
    }

    pub fn boundary(&self, side: Side) -> BoundaryKind {
        match side {
            Side::Low => self.low,
            Side::High => self.high,
        }
    }
}

/// Origin and extent of the domain, used to normalise coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub dim: usize,
    pub origin: [f64; MAX_DIM],
    pub length: [f64; MAX_DIM],
}

impl Geometry {
    /// Map a physical position into the unit cube.
    pub fn normalized(&self, x: [f64; MAX_DIM]) -> [f64; MAX_DIM] {
        let mut xi = [0.0; MAX_DIM];
        for a in 0..self.dim {
            xi[a] = (x[a] - self.origin[a]) / self.length[a];
        }
        xi
    }
}

/// Uniform, vertex-centred structured grid in one to three dimensions.
///
/// Nodes are stored in a flat array with axis 0 varying fastest. A grid is
/// immutable; refinement produces a new, independent instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    axes: Vec<Axis>,
    strides: [usize; MAX_DIM],
    len: usize,
}

impl Grid {
    /// Build a grid from per-axis descriptions.
    ///
    /// Fails with [`PdeError::Configuration`] when the dimension is not 1..=3,
    /// an axis has fewer than two cells, a length is not positive and finite,
    /// or periodicity is declared on only one face of an axis.
    pub fn new(specs: &[AxisSpec]) -> Result<Self> {
        if specs.is_empty() || specs.len() > MAX_DIM {
            return Err(PdeError::config(format!(
                "grid must have 1 to {MAX_DIM} axes, got {}",
                specs.len()
            )));
        }

        let mut axes = Vec::with_capacity(specs.len());
        for (a, spec) in specs.iter().enumerate() {
            if spec.cells < 2 {
                return Err(PdeError::config(format!(
                    "axis {a}: resolution must be at least 2 cells, got {}",
                    spec.cells
                )));
            }
            if !(spec.length.is_finite() && spec.length > 0.0) {
                return Err(PdeError::config(format!(
                    "axis {a}: length must be positive, got {}",
                    spec.length
                )));
            }
            if !spec.origin.is_finite() {
                return Err(PdeError::config(format!("axis {a}: origin is not finite")));
            }
            let low_periodic = spec.low == BoundaryKind::Periodic;
            let high_periodic = spec.high == BoundaryKind::Periodic;
            if low_periodic != high_periodic {
                return Err(PdeError::config(format!(
                    "axis {a}: periodic boundary must be set on both faces"
                )));
            }

            let spacing = spec.length / spec.cells as f64;
            if spacing <= 0.0 {
                return Err(PdeError::config(format!(
                    "axis {a}: spacing must be positive, got {spacing}"
                )));
            }
            let nodes = if low_periodic {
                spec.cells
            } else {
                spec.cells + 1
            };
            axes.push(Axis {
                cells: spec.cells,
                length: spec.length,
                origin: spec.origin,
                spacing,
                nodes,
                low: spec.low,
                high: spec.high,
            });
        }

        let mut strides = [0; MAX_DIM];
        let mut len = 1;
        for (a, axis) in axes.iter().enumerate() {
            strides[a] = len;
            len *= axis.nodes;
        }

        Ok(Self { axes, strides, len })
    }

    /// A new grid with every axis refined by `factor`.
    pub fn refined(&self, factor: usize) -> Result<Self> {
        let specs: Vec<AxisSpec> = self
            .axes
            .iter()
            .map(|axis| AxisSpec {
                cells: axis.cells * factor,
                length: axis.length,
                origin: axis.origin,
                low: axis.low,
                high: axis.high,
            })
            .collect();
        Self::new(&specs)
    }

    /// The grid with every second node along each axis, or `None` when some
    /// axis has an odd cell count or would drop below two cells.
    pub fn coarsened(&self) -> Option<Self> {
        if self.axes.iter().any(|a| a.cells % 2 != 0 || a.cells < 4) {
            return None;
        }
        let specs: Vec<AxisSpec> = self
            .axes
            .iter()
            .map(|axis| AxisSpec {
                cells: axis.cells / 2,
                length: axis.length,
                origin: axis.origin,
                low: axis.low,
                high: axis.high,
            })
            .collect();
        Self::new(&specs).ok()
    }

    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    /// Total number of stored nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn axis(&self, a: usize) -> &Axis {
        &self.axes[a]
    }

    pub fn spacing(&self, a: usize) -> f64 {
        self.axes[a].spacing
    }

    /// Largest spacing over all axes.
    pub fn max_spacing(&self) -> f64 {
        self.axes.iter().map(|a| a.spacing).fold(0.0, f64::max)
    }

    /// Volume associated with one node, used for discrete norms.
    pub fn cell_volume(&self) -> f64 {
        self.axes.iter().map(|a| a.spacing).product()
    }

    pub fn geometry(&self) -> Geometry {
        let mut origin = [0.0; MAX_DIM];
        let mut length = [1.0; MAX_DIM];
        for (a, axis) in self.axes.iter().enumerate() {
            origin[a] = axis.origin;
            length[a] = axis.length;
        }
        Geometry {
            dim: self.dim(),
            origin,
            length,
        }
    }

    /// Per-axis node indices of a flat index. Unused axes are zero.
    pub fn multi_index(&self, idx: usize) -> [usize; MAX_DIM] {
        let mut ijk = [0; MAX_DIM];
        let mut rest = idx;
        for (a, axis) in self.axes.iter().enumerate() {
            ijk[a] = rest % axis.nodes;
            rest /= axis.nodes;
        }
        ijk
    }

    pub fn flat_index(&self, ijk: [usize; MAX_DIM]) -> usize {
        (0..self.dim()).map(|a| ijk[a] * self.strides[a]).sum()
    }

    /// Physical position of a node.
    pub fn position(&self, idx: usize) -> [f64; MAX_DIM] {
        let ijk = self.multi_index(idx);
        let mut x = [0.0; MAX_DIM];
        for (a, axis) in self.axes.iter().enumerate() {
            x[a] = axis.origin + ijk[a] as f64 * axis.spacing;
        }
        x
    }

    /// Neighbour of `idx` along `axis` towards `side`.
    ///
    /// Periodic axes wrap around; on other axes a node on the face has no
    /// neighbour outside the domain and `None` is returned.
    pub fn neighbor(&self, idx: usize, axis: usize, side: Side) -> Option<usize> {
        let ax = &self.axes[axis];
        let i = (idx / self.strides[axis]) % ax.nodes;
        let j = match side {
            Side::Low if i > 0 => i - 1,
            Side::Low if ax.is_periodic() => ax.nodes - 1,
            Side::Low => return None,
            Side::High if i + 1 < ax.nodes => i + 1,
            Side::High if ax.is_periodic() => 0,
            Side::High => return None,
        };
        Some(idx - i * self.strides[axis] + j * self.strides[axis])
    }

    /// All existing neighbours of a node, with duplicates removed.
    pub fn neighbors(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(2 * self.dim());
        for a in 0..self.dim() {
            for side in [Side::Low, Side::High] {
                if let Some(j) = self.neighbor(idx, a, side) {
                    if j != idx && !out.contains(&j) {
                        out.push(j);
                    }
                }
            }
        }
        out
    }

    /// Faces (axis, side) of non-periodic axes the node lies on.
    pub fn boundary_faces(&self, idx: usize) -> impl Iterator<Item = (usize, Side)> + '_ {
        let ijk = self.multi_index(idx);
        self.axes.iter().enumerate().flat_map(move |(a, axis)| {
            let low = (!axis.is_periodic() && ijk[a] == 0).then_some((a, Side::Low));
            let high = (!axis.is_periodic() && ijk[a] + 1 == axis.nodes).then_some((a, Side::High));
            low.into_iter().chain(high)
        })
    }

    /// True when the node lies on any Dirichlet face. Such nodes carry
    /// prescribed values and are not unknowns.
    pub fn is_dirichlet(&self, idx: usize) -> bool {
        self.boundary_faces(idx)
            .any(|(a, side)| self.axes[a].boundary(side) == BoundaryKind::Dirichlet)
    }

    /// True when at least one face carries a Dirichlet condition.
    pub fn has_dirichlet_face(&self) -> bool {
        self.axes
            .iter()
            .any(|a| a.low == BoundaryKind::Dirichlet || a.high == BoundaryKind::Dirichlet)
    }
}
