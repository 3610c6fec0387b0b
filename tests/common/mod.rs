//! Common test utilities for DTI-core integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use dti_core::{DwiVolume, GradientTable, Grid, SymmetricTensor};

const S: f64 = std::f64::consts::FRAC_1_SQRT_2;
const C: f64 = 0.577_350_269_189_625_8;

/// Twelve non-collinear unit directions (axes, face and body diagonals)
pub fn spread_directions() -> Vec<[f64; 3]> {
    vec![
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [S, S, 0.0],
        [S, -S, 0.0],
        [S, 0.0, S],
        [S, 0.0, -S],
        [0.0, S, S],
        [0.0, S, -S],
        [C, C, C],
        [C, -C, C],
        [C, C, -C],
    ]
}

/// Gradient table with `n_baselines` leading baselines followed by `directions`
pub fn gradient_table(b_value: f64, n_baselines: usize, directions: &[[f64; 3]]) -> GradientTable {
    let mut all = vec![[0.0; 3]; n_baselines];
    all.extend_from_slice(directions);
    GradientTable::from_directions(b_value, &all).unwrap()
}

/// Noise-free signal `S0 exp(-b gᵀDg)` for every entry of the table
pub fn synthetic_sample(s0: f64, table: &GradientTable, tensor: &SymmetricTensor) -> Vec<f64> {
    table.directions()
        .iter()
        .map(|g| s0 * (-table.b_value() * tensor.quadratic_form(g)).exp())
        .collect()
}

/// Synthetic signal with a fixed, reproducible perturbation of amplitude `amplitude`
pub fn noisy_sample(
    s0: f64,
    table: &GradientTable,
    tensor: &SymmetricTensor,
    amplitude: f64,
) -> Vec<f64> {
    synthetic_sample(s0, table, tensor)
        .into_iter()
        .enumerate()
        .map(|(k, s)| s + amplitude * (k as f64 * 2.399_963 + 0.5).sin())
        .collect()
}

/// Single-row volume with one sample per voxel
pub fn volume_from_samples(samples: &[Vec<f64>]) -> DwiVolume {
    let n_channels = samples[0].len();
    let grid = Grid::new((samples.len(), 1, 1), (2.0, 2.0, 2.0), Grid::identity_affine());
    DwiVolume::new(grid, n_channels, samples.concat()).unwrap()
}

pub fn prolate_tensor() -> SymmetricTensor {
    SymmetricTensor::new(1.4e-3, 1.0e-4, -5.0e-5, 5.0e-4, 8.0e-5, 4.0e-4)
}

/// Largest absolute component difference between two tensors
pub fn max_component_error(a: &SymmetricTensor, b: &SymmetricTensor) -> f64 {
    a.0.iter().zip(b.0.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Euclidean distance between two tensors' parameter vectors
pub fn tensor_distance(a: &SymmetricTensor, b: &SymmetricTensor) -> f64 {
    a.0.iter().zip(b.0.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Unique path under the system temp directory
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dti_core_{}_{}", std::process::id(), name))
}

/// Write a DWI volume as a 4D NIfTI file
///
/// Encodes the volume-major data as a 3D image stacked along z, then
/// rewrites the dim field to (nx, ny, nz, nt).
pub fn write_dwi_nifti(path: &std::path::Path, dwi: &DwiVolume) {
    let (nx, ny, nz) = dwi.grid.dims;
    let nt = dwi.n_channels;
    let n_voxels = nx * ny * nz;
    let mut volume_major = vec![0.0; n_voxels * nt];
    for v in 0..n_voxels {
        for (t, &s) in dwi.sample(v).iter().enumerate() {
            volume_major[t * n_voxels + v] = s;
        }
    }
    let mut bytes = dti_core::nifti_io::save_nifti(
        &volume_major,
        (nx, ny, nz * nt),
        dwi.grid.voxel_size,
        &dwi.grid.affine,
    ).unwrap();
    let dim: [i16; 5] = [4, nx as i16, ny as i16, nz as i16, nt as i16];
    for (i, d) in dim.iter().enumerate() {
        bytes[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    std::fs::write(path, bytes).unwrap();
}
