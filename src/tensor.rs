//! Symmetric diffusion tensor and tensor volumes

use nalgebra::Vector3;

use crate::volume::Grid;

/// Symmetric 3x3 diffusion tensor
///
/// Stored as the six independent components in design-matrix order:
/// `[xx, xy, xz, yy, yz, zz]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SymmetricTensor(pub [f64; 6]);

impl SymmetricTensor {
    pub const ZERO: SymmetricTensor = SymmetricTensor([0.0; 6]);

    pub fn new(xx: f64, xy: f64, xz: f64, yy: f64, yz: f64, zz: f64) -> Self {
        SymmetricTensor([xx, xy, xz, yy, yz, zz])
    }

    pub fn xx(&self) -> f64 { self.0[0] }
    pub fn xy(&self) -> f64 { self.0[1] }
    pub fn xz(&self) -> f64 { self.0[2] }
    pub fn yy(&self) -> f64 { self.0[3] }
    pub fn yz(&self) -> f64 { self.0[4] }
    pub fn zz(&self) -> f64 { self.0[5] }

    /// Apparent diffusion along `g`: `gᵀ D g`
    pub fn quadratic_form(&self, g: &Vector3<f64>) -> f64 {
        let [xx, xy, xz, yy, yz, zz] = self.0;
        xx * g.x * g.x
            + 2.0 * xy * g.x * g.y
            + 2.0 * xz * g.x * g.z
            + yy * g.y * g.y
            + 2.0 * yz * g.y * g.z
            + zz * g.z * g.z
    }

    pub fn trace(&self) -> f64 {
        self.0[0] + self.0[3] + self.0[5]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Components in NIfTI symmetric-matrix order (lower triangle, row-wise)
    pub fn lower_triangular(&self) -> [f64; 6] {
        let [xx, xy, xz, yy, yz, zz] = self.0;
        [xx, xy, yy, xz, yz, zz]
    }
}

/// One tensor per voxel on a spatial grid
#[derive(Debug, Clone)]
pub struct TensorVolume {
    pub grid: Grid,
    pub tensors: Vec<SymmetricTensor>,
}

impl TensorVolume {
    pub fn zeros(grid: Grid) -> Self {
        let n = grid.n_voxels();
        TensorVolume { grid, tensors: vec![SymmetricTensor::ZERO; n] }
    }

    /// Component-major planes in lower-triangular order, six planes of
    /// `nx*ny*nz` values each, as stored in a NIfTI symmetric-matrix volume.
    pub fn to_component_planes(&self) -> Vec<f64> {
        let n = self.tensors.len();
        let mut planes = vec![0.0; 6 * n];
        for (v, t) in self.tensors.iter().enumerate() {
            for (c, value) in t.lower_triangular().iter().enumerate() {
                planes[c * n + v] = *value;
            }
        }
        planes
    }

    /// Number of voxels that received a non-zero tensor
    pub fn estimated_count(&self) -> usize {
        self.tensors.iter().filter(|t| !t.is_zero()).count()
    }
}
