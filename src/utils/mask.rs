//! Voxel masking of diffusion-weighted volumes
//!
//! Masking zeroes the whole signal vector of a rejected voxel. Estimators
//! treat an all-zero sample as background and emit the zero tensor for it.

use crate::error::Result;
use crate::volume::{DwiVolume, MaskVolume};

/// Keep voxels where the mask is non-zero
///
/// # Returns
/// Number of voxels that were zeroed
pub fn apply_inclusion_mask(dwi: &mut DwiVolume, mask: &MaskVolume) -> Result<usize> {
    apply_mask(dwi, mask, |m| m != 0.0)
}

/// Keep voxels where the mask is zero or negative (bad-region mask)
///
/// # Returns
/// Number of voxels that were zeroed
pub fn apply_exclusion_mask(dwi: &mut DwiVolume, mask: &MaskVolume) -> Result<usize> {
    apply_mask(dwi, mask, |m| m <= 0.0)
}

fn apply_mask<F>(dwi: &mut DwiVolume, mask: &MaskVolume, keep: F) -> Result<usize>
where
    F: Fn(f64) -> bool,
{
    dwi.grid.ensure_matches(&mask.grid)?;

    let n_channels = dwi.n_channels;
    let mut zeroed = 0;
    for (sample, &m) in dwi.data.chunks_exact_mut(n_channels).zip(mask.data.iter()) {
        if !keep(m) {
            sample.fill(0.0);
            zeroed += 1;
        }
    }
    Ok(zeroed)
}

/// Number of voxels whose sample is entirely zero
pub fn count_empty_voxels(dwi: &DwiVolume) -> usize {
    dwi.data
        .chunks_exact(dwi.n_channels)
        .filter(|s| s.iter().all(|&v| v == 0.0))
        .count()
}
