//! Isotropic diffusion-weighted image (IDWI)
//!
//! Geometric mean of all diffusion-weighted channels at each voxel:
//! `exp(mean(ln S_i))` over non-baseline directions.

use rayon::prelude::*;

use crate::error::{DtiError, Result};
use crate::gradients::GradientTable;
use crate::volume::DwiVolume;

/// Geometric mean of the diffusion-weighted signals of one sample
///
/// A non-positive signal sends the log-sum to -inf, so the voxel is 0.
pub fn geometric_mean(sample: &[f64], weighted: &[usize]) -> f64 {
    if weighted.is_empty() {
        return 0.0;
    }
    let mut log_sum = 0.0;
    for &i in weighted {
        let s = sample[i];
        if !(s.is_finite() && s > 0.0) {
            return 0.0;
        }
        log_sum += s.ln();
    }
    (log_sum / weighted.len() as f64).exp()
}

/// Compute the IDWI volume
///
/// # Returns
/// One value per voxel, in voxel order
pub fn idwi(dwi: &DwiVolume, gradients: &GradientTable) -> Result<Vec<f64>> {
    if gradients.len() != dwi.n_channels {
        return Err(DtiError::config(format!(
            "Gradient table has {} entries but volume has {} channels",
            gradients.len(), dwi.n_channels
        )));
    }
    let weighted = gradients.weighted_indices();
    if weighted.is_empty() {
        return Err(DtiError::config("IDWI needs at least one diffusion-weighted direction"));
    }

    Ok(dwi.data
        .par_chunks(dwi.n_channels)
        .map(|sample| geometric_mean(sample, &weighted))
        .collect())
}
