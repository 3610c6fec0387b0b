//! Spatial grids and diffusion-weighted volumes
//!
//! Voxel indices use Fortran (column-major) ordering to match the NIfTI
//! convention: index = x + y*nx + z*nx*ny.

use nalgebra::Matrix3;

use crate::error::{DtiError, Result};

/// Affine entries closer than this are treated as the same geometry
const AFFINE_TOLERANCE: f64 = 1e-3;

/// Spatial sampling grid of a volume
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl Grid {
    pub fn new(
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Self {
        Grid { dims, voxel_size, affine }
    }

    pub fn identity_affine() -> [f64; 16] {
        [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Direction-cosine matrix of the grid
    ///
    /// Columns of the affine's 3x3 block, each normalized to unit length so
    /// voxel scaling is removed. Degenerate columns fall back to the
    /// corresponding identity axis.
    pub fn image_frame(&self) -> Matrix3<f64> {
        let a = &self.affine;
        let mut frame = Matrix3::new(
            a[0], a[1], a[2],
            a[4], a[5], a[6],
            a[8], a[9], a[10],
        );
        for j in 0..3 {
            let norm = frame.column(j).norm();
            if norm > 1e-12 {
                frame.column_mut(j).unscale_mut(norm);
            } else {
                frame.column_mut(j).fill(0.0);
                frame[(j, j)] = 1.0;
            }
        }
        frame
    }

    /// Check that `other` samples the same space as `self`
    pub fn ensure_matches(&self, other: &Grid) -> Result<()> {
        let same_affine = self.affine.iter()
            .zip(other.affine.iter())
            .all(|(a, b)| (a - b).abs() <= AFFINE_TOLERANCE);
        if self.dims != other.dims || !same_affine {
            return Err(DtiError::GeometryMismatch {
                expected: self.describe(),
                found: other.describe(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let (nx, ny, nz) = self.dims;
        let a = &self.affine;
        format!(
            "{}x{}x{} origin=({:.3}, {:.3}, {:.3})",
            nx, ny, nz, a[3], a[7], a[11]
        )
    }
}

/// Diffusion-weighted volume with voxel-major channel storage
///
/// `data[voxel * n_channels + channel]`, so each voxel's signal sample is a
/// contiguous slice.
#[derive(Debug, Clone)]
pub struct DwiVolume {
    pub grid: Grid,
    pub n_channels: usize,
    pub data: Vec<f64>,
}

impl DwiVolume {
    /// Build from voxel-major data
    pub fn new(grid: Grid, n_channels: usize, data: Vec<f64>) -> Result<Self> {
        if n_channels == 0 {
            return Err(DtiError::config("DWI volume has no channels"));
        }
        let expected = grid.n_voxels() * n_channels;
        if data.len() != expected {
            return Err(DtiError::config(format!(
                "DWI data length {} does not match {} voxels x {} channels",
                data.len(), grid.n_voxels(), n_channels
            )));
        }
        Ok(DwiVolume { grid, n_channels, data })
    }

    /// Build from volume-major (4D NIfTI) data
    ///
    /// Input layout is `x + y*nx + z*nx*ny + t*nx*ny*nz`.
    pub fn from_volume_major(
        data: &[f64],
        dims: (usize, usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Result<Self> {
        let (nx, ny, nz, nt) = dims;
        let n_voxels = nx * ny * nz;
        if data.len() != n_voxels * nt {
            return Err(DtiError::config(format!(
                "4D data length {} does not match {}x{}x{}x{}",
                data.len(), nx, ny, nz, nt
            )));
        }
        let mut interleaved = vec![0.0; data.len()];
        for t in 0..nt {
            let plane = &data[t * n_voxels..(t + 1) * n_voxels];
            for (v, &value) in plane.iter().enumerate() {
                interleaved[v * nt + t] = value;
            }
        }
        DwiVolume::new(Grid::new((nx, ny, nz), voxel_size, affine), nt, interleaved)
    }

    pub fn n_voxels(&self) -> usize {
        self.grid.n_voxels()
    }

    /// Signal sample of one voxel
    pub fn sample(&self, voxel: usize) -> &[f64] {
        let start = voxel * self.n_channels;
        &self.data[start..start + self.n_channels]
    }

    /// Extract one channel as a scalar image
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        self.data
            .chunks_exact(self.n_channels)
            .map(|s| s[channel])
            .collect()
    }
}

/// Scalar label/mask volume
#[derive(Debug, Clone)]
pub struct MaskVolume {
    pub grid: Grid,
    pub data: Vec<f64>,
}

impl MaskVolume {
    pub fn new(grid: Grid, data: Vec<f64>) -> Result<Self> {
        if data.len() != grid.n_voxels() {
            return Err(DtiError::config(format!(
                "Mask data length {} does not match {} voxels",
                data.len(), grid.n_voxels()
            )));
        }
        Ok(MaskVolume { grid, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_volume_major_interleaves_channels() {
        // 2 voxels, 3 channels, volume-major
        let data = vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0];
        let dwi = DwiVolume::from_volume_major(
            &data, (2, 1, 1, 3), (1.0, 1.0, 1.0), Grid::identity_affine(),
        ).unwrap();
        assert_eq!(dwi.sample(0), &[1.0, 10.0, 100.0]);
        assert_eq!(dwi.sample(1), &[2.0, 20.0, 200.0]);
        assert_eq!(dwi.channel(2), vec![100.0, 200.0]);
    }

    #[test]
    fn test_from_volume_major_length_mismatch() {
        let result = DwiVolume::from_volume_major(
            &[0.0; 5], (2, 1, 1, 3), (1.0, 1.0, 1.0), Grid::identity_affine(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_image_frame_removes_voxel_scaling() {
        let affine = [
            0.0, -2.0, 0.0, 5.0,
            2.5, 0.0, 0.0, 6.0,
            0.0, 0.0, 3.0, 7.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let grid = Grid::new((4, 4, 4), (2.5, 2.0, 3.0), affine);
        let frame = grid.image_frame();
        let expected = Matrix3::new(
            0.0, -1.0, 0.0,
            1.0, 0.0, 0.0,
            0.0, 0.0, 1.0,
        );
        assert!((frame - expected).norm() < 1e-12);
    }

    #[test]
    fn test_grid_mismatch() {
        let a = Grid::new((4, 4, 4), (1.0, 1.0, 1.0), Grid::identity_affine());
        let b = Grid::new((4, 4, 5), (1.0, 1.0, 1.0), Grid::identity_affine());
        match a.ensure_matches(&b) {
            Err(DtiError::GeometryMismatch { expected, found }) => {
                assert!(expected.contains("4x4x4"));
                assert!(found.contains("4x4x5"));
            }
            other => panic!("expected geometry mismatch, got {:?}", other),
        }

        let mut shifted = a.clone();
        shifted.affine[3] = 10.0;
        assert!(a.ensure_matches(&shifted).is_err());
        assert!(a.ensure_matches(&a.clone()).is_ok());
    }
}
