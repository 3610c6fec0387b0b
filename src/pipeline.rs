//! End-to-end tensor estimation
//!
//! Runs the whole data flow on one diffusion-weighted volume:
//!
//! 1. Reorient the gradient table from the measurement frame into the image frame
//! 2. Determine the baseline threshold (explicit, or Otsu on the unmasked baseline)
//! 3. Apply inclusion and exclusion masks
//! 4. Estimate a tensor at every voxel with the selected estimator
//! 5. Optionally derive the IDWI image and the threshold mask
//!
//! Every configuration and geometry check happens before any voxel is
//! touched, so a bad run fails without partial output.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use crate::error::{DtiError, Result};
use crate::estimation::{estimate_tensors_with_progress, Estimator, EstimatorParams};
use crate::idwi::idwi;
use crate::metadata::DwiHeader;
use crate::tensor::TensorVolume;
use crate::utils::{
    apply_exclusion_mask, apply_inclusion_mask, baseline_threshold, count_empty_voxels,
    threshold_mask, DEFAULT_OTSU_BINS,
};
use crate::volume::{DwiVolume, MaskVolume};

/// Parameters for a tensor estimation run
#[derive(Debug, Clone, PartialEq)]
pub struct DtiParams {
    pub estimator: EstimatorParams,
    /// Baseline threshold; `None` derives it with Otsu's method
    pub threshold: Option<f64>,
    /// Histogram bins for the Otsu threshold
    pub otsu_bins: usize,
    pub compute_idwi: bool,
    pub compute_threshold_mask: bool,
}

impl Default for DtiParams {
    fn default() -> Self {
        DtiParams {
            estimator: EstimatorParams::default(),
            threshold: None,
            otsu_bins: DEFAULT_OTSU_BINS,
            compute_idwi: false,
            compute_threshold_mask: false,
        }
    }
}

impl DtiParams {
    pub fn validate(&self) -> Result<()> {
        self.estimator.validate()?;
        if self.otsu_bins == 0 {
            return Err(DtiError::config("Otsu histogram needs at least one bin"));
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() {
                return Err(DtiError::config(format!("Invalid threshold {}", t)));
            }
        }
        Ok(())
    }
}

/// Optional voxel masks on the DWI grid
#[derive(Debug, Clone, Default)]
pub struct Masks {
    /// Brain mask: voxels where it is zero are skipped
    pub inclusion: Option<MaskVolume>,
    /// Bad-region mask: voxels where it is positive are skipped
    pub exclusion: Option<MaskVolume>,
}

/// Result of a tensor estimation run
#[derive(Debug, Clone)]
pub struct DtiOutput {
    pub tensors: TensorVolume,
    /// Baseline threshold that was applied
    pub threshold: f64,
    /// Voxels with an all-zero sample once masks are applied
    pub empty_voxels: usize,
    pub idwi: Option<Vec<f64>>,
    pub threshold_mask: Option<Vec<u8>>,
}

/// Estimate the tensor volume of `dwi`
///
/// # Arguments
/// * `dwi` - Diffusion-weighted volume (masked in place)
/// * `header` - Gradient table and measurement frame of the acquisition
/// * `masks` - Optional inclusion and exclusion masks
/// * `params` - Estimation parameters
///
/// # Returns
/// Tensor volume with the threshold used and any requested derived images
pub fn run_dti(
    dwi: DwiVolume,
    header: &DwiHeader,
    masks: &Masks,
    params: &DtiParams,
) -> Result<DtiOutput> {
    run_dti_with_progress(dwi, header, masks, params, |_, _| {})
}

/// Estimate the tensor volume with a progress callback
///
/// `progress(done, total)` counts voxels and is called from worker threads.
pub fn run_dti_with_progress<F>(
    mut dwi: DwiVolume,
    header: &DwiHeader,
    masks: &Masks,
    params: &DtiParams,
    progress: F,
) -> Result<DtiOutput>
where
    F: Fn(usize, usize) + Sync,
{
    params.validate()?;

    if header.gradients.len() != dwi.n_channels {
        return Err(DtiError::config(format!(
            "Header lists {} gradient directions but the image has {} channels",
            header.gradients.len(), dwi.n_channels
        )));
    }
    let baselines = header.gradients.baseline_indices();
    let (first_baseline, last_baseline) = match (baselines.first(), baselines.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => return Err(DtiError::config("No baseline (zero-gradient) image in the acquisition")),
    };
    for mask in masks.inclusion.iter().chain(masks.exclusion.iter()) {
        dwi.grid.ensure_matches(&mask.grid)?;
    }

    let transform = header.reorientation(&dwi.grid.image_frame())?;
    let mut gradients = header.gradients.clone();
    gradients.reorient(&transform);

    let threshold = match params.threshold {
        Some(t) => t,
        None => {
            let t = baseline_threshold(&dwi.channel(first_baseline), params.otsu_bins);
            info!("Baseline threshold (Otsu): {:.4}", t);
            t
        }
    };

    // Built before masking so configuration errors surface first
    let estimator = Estimator::new(&gradients, threshold, &params.estimator)?;

    if let Some(mask) = &masks.inclusion {
        let zeroed = apply_inclusion_mask(&mut dwi, mask)?;
        info!("Brain mask excluded {} voxels", zeroed);
    }
    if let Some(mask) = &masks.exclusion {
        let zeroed = apply_exclusion_mask(&mut dwi, mask)?;
        info!("Bad-region mask excluded {} voxels", zeroed);
    }
    let empty_voxels = count_empty_voxels(&dwi);
    info!("{} of {} voxels have no signal", empty_voxels, dwi.n_voxels());

    info!(
        "Estimating tensors: method={}, {} voxels, {} channels",
        params.estimator.method, dwi.n_voxels(), dwi.n_channels
    );
    let reported = AtomicUsize::new(0);
    let tensors = estimate_tensors_with_progress(&dwi, &estimator, |done, total| {
        progress(done, total);
        let decile = if total == 0 { 10 } else { done * 10 / total };
        if reported.fetch_max(decile, Ordering::Relaxed) < decile {
            info!("  {}% of voxels estimated", decile * 10);
        }
    });
    info!("Estimated {} non-zero tensors", tensors.estimated_count());

    let idwi = if params.compute_idwi {
        Some(idwi(&dwi, &gradients)?)
    } else {
        None
    };
    let threshold_mask = if params.compute_threshold_mask {
        Some(threshold_mask(&dwi.channel(last_baseline), threshold))
    } else {
        None
    };

    Ok(DtiOutput {
        tensors,
        threshold,
        empty_voxels,
        idwi,
        threshold_mask,
    })
}
