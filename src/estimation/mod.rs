//! Per-voxel diffusion tensor estimation
//!
//! Four interchangeable estimators share one interface:
//! - Linear: least squares on the log-linearized signal
//! - Weighted: iteratively reweighted least squares
//! - Nonlinear: gradient descent on raw signal residuals
//! - MaximumLikelihood: gradient descent on the Rician likelihood
//!
//! The estimator is selected once and then applied independently to every
//! voxel of a volume by a rayon worker pool.

pub mod descent;
pub mod linear;
pub mod model;
pub mod nonlinear;
pub mod rician;
pub mod weighted;

pub use descent::GradientDescent;
pub use linear::LinearEstimator;
pub use model::{Observations, SignalModel};
pub use nonlinear::NonlinearEstimator;
pub use rician::RicianEstimator;
pub use weighted::{InitialWeights, WeightedEstimator};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::debug;

use crate::error::{DtiError, Result};
use crate::gradients::GradientTable;
use crate::tensor::{SymmetricTensor, TensorVolume};
use crate::volume::DwiVolume;

/// Voxels handed to a worker at a time
const CHUNK_VOXELS: usize = 2048;

/// Estimate one tensor from one voxel's signal sample
///
/// Returns the zero tensor for background voxels (baseline below threshold)
/// and for voxels whose fit is numerically degenerate.
pub trait TensorEstimator: Sync {
    fn estimate(&self, sample: &[f64]) -> SymmetricTensor;
}

/// Estimation algorithm choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EstimationMethod {
    #[default]
    Linear,
    Weighted,
    Nonlinear,
    MaximumLikelihood,
}

impl FromStr for EstimationMethod {
    type Err = DtiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lls" | "linear" => Ok(EstimationMethod::Linear),
            "wls" | "weighted" => Ok(EstimationMethod::Weighted),
            "nls" | "nonlinear" => Ok(EstimationMethod::Nonlinear),
            "ml" => Ok(EstimationMethod::MaximumLikelihood),
            _ => Err(DtiError::config(format!(
                "Estimation type '{}' invalid. Only \"lls\", \"wls\", \"nls\", and \"ml\" allowed.",
                s
            ))),
        }
    }
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EstimationMethod::Linear => "lls",
            EstimationMethod::Weighted => "wls",
            EstimationMethod::Nonlinear => "nls",
            EstimationMethod::MaximumLikelihood => "ml",
        };
        f.write_str(name)
    }
}

/// Estimator settings
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorParams {
    pub method: EstimationMethod,
    /// WLS reweighting passes after the initial fit
    pub weight_iterations: usize,
    /// WLS early stop on relative tensor change; `None` runs every pass
    pub weight_tolerance: Option<f64>,
    pub initial_weights: InitialWeights,
    /// Initial gradient-descent step (NLS and ML)
    pub step: f64,
    /// Gradient-descent iteration budget (NLS and ML)
    pub max_iterations: usize,
    /// Rician noise level, required for ML
    pub sigma: Option<f64>,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        EstimatorParams {
            method: EstimationMethod::Linear,
            weight_iterations: 1,
            weight_tolerance: None,
            initial_weights: InitialWeights::Uniform,
            step: 1.0e-8,
            max_iterations: 1000,
            sigma: None,
        }
    }
}

impl EstimatorParams {
    pub fn validate(&self) -> Result<()> {
        let uses_descent = matches!(
            self.method,
            EstimationMethod::Nonlinear | EstimationMethod::MaximumLikelihood
        );
        if uses_descent && (!self.step.is_finite() || self.step <= 0.0) {
            return Err(DtiError::config(format!(
                "Step size must be positive for {}, got {}", self.method, self.step
            )));
        }
        if uses_descent && self.max_iterations == 0 {
            return Err(DtiError::config("Iteration budget must be at least 1"));
        }
        if self.method == EstimationMethod::MaximumLikelihood {
            match self.sigma {
                None => return Err(DtiError::config("Noise level sigma not set for ml estimation")),
                Some(s) if !s.is_finite() || s <= 0.0 => {
                    return Err(DtiError::config(format!(
                        "Noise level sigma must be positive, got {}", s
                    )));
                }
                Some(_) => {}
            }
        }
        if let Some(tol) = self.weight_tolerance {
            if !tol.is_finite() || tol < 0.0 {
                return Err(DtiError::config(format!("Invalid weight tolerance {}", tol)));
            }
        }
        Ok(())
    }

    fn descent(&self) -> GradientDescent {
        GradientDescent {
            step: self.step,
            max_iterations: self.max_iterations,
            ..GradientDescent::default()
        }
    }
}

/// The selected estimator
#[derive(Debug, Clone)]
pub enum Estimator {
    Linear(LinearEstimator),
    Weighted(WeightedEstimator),
    Nonlinear(NonlinearEstimator),
    MaximumLikelihood(RicianEstimator),
}

impl Estimator {
    /// Build the estimator chosen in `params` for a gradient table and threshold
    pub fn new(
        gradients: &GradientTable,
        threshold: f64,
        params: &EstimatorParams,
    ) -> Result<Self> {
        params.validate()?;
        let estimator = match params.method {
            EstimationMethod::Linear => {
                Estimator::Linear(LinearEstimator::new(gradients, threshold)?)
            }
            EstimationMethod::Weighted => Estimator::Weighted(WeightedEstimator::new(
                gradients,
                threshold,
                params.weight_iterations,
                params.weight_tolerance,
                params.initial_weights,
            )?),
            EstimationMethod::Nonlinear => Estimator::Nonlinear(NonlinearEstimator::new(
                gradients,
                threshold,
                params.descent(),
            )?),
            EstimationMethod::MaximumLikelihood => {
                let sigma = params.sigma.ok_or_else(|| {
                    DtiError::config("Noise level sigma not set for ml estimation")
                })?;
                Estimator::MaximumLikelihood(RicianEstimator::new(
                    gradients,
                    threshold,
                    params.descent(),
                    sigma,
                )?)
            }
        };
        Ok(estimator)
    }

    pub fn method(&self) -> EstimationMethod {
        match self {
            Estimator::Linear(_) => EstimationMethod::Linear,
            Estimator::Weighted(_) => EstimationMethod::Weighted,
            Estimator::Nonlinear(_) => EstimationMethod::Nonlinear,
            Estimator::MaximumLikelihood(_) => EstimationMethod::MaximumLikelihood,
        }
    }
}

impl TensorEstimator for Estimator {
    fn estimate(&self, sample: &[f64]) -> SymmetricTensor {
        match self {
            Estimator::Linear(e) => e.estimate(sample),
            Estimator::Weighted(e) => e.estimate(sample),
            Estimator::Nonlinear(e) => e.estimate(sample),
            Estimator::MaximumLikelihood(e) => e.estimate(sample),
        }
    }
}

/// Zero tensor unless every component is finite
pub(crate) fn tensor_or_zero(t: [f64; 6]) -> SymmetricTensor {
    let tensor = SymmetricTensor(t);
    if tensor.is_finite() {
        tensor
    } else {
        SymmetricTensor::ZERO
    }
}

/// Estimate a tensor at every voxel of `dwi`
pub fn estimate_tensors<E>(dwi: &DwiVolume, estimator: &E) -> TensorVolume
where
    E: TensorEstimator + ?Sized,
{
    estimate_tensors_with_progress(dwi, estimator, |_, _| {})
}

/// Estimate tensors with a progress callback
///
/// `progress(done, total)` is called from worker threads after each chunk of
/// voxels, so it must be thread-safe.
pub fn estimate_tensors_with_progress<E, F>(
    dwi: &DwiVolume,
    estimator: &E,
    progress: F,
) -> TensorVolume
where
    E: TensorEstimator + ?Sized,
    F: Fn(usize, usize) + Sync,
{
    let n_voxels = dwi.n_voxels();
    let n_channels = dwi.n_channels;
    let mut volume = TensorVolume::zeros(dwi.grid.clone());
    let done = AtomicUsize::new(0);

    volume.tensors
        .par_chunks_mut(CHUNK_VOXELS)
        .zip(dwi.data.par_chunks(CHUNK_VOXELS * n_channels))
        .for_each(|(out, samples)| {
            for (tensor, sample) in out.iter_mut().zip(samples.chunks_exact(n_channels)) {
                *tensor = estimator.estimate(sample);
            }
            let finished = done.fetch_add(out.len(), Ordering::Relaxed) + out.len();
            progress(finished, n_voxels);
        });

    debug!(
        "Estimated {} of {} voxels",
        volume.estimated_count(),
        n_voxels
    );
    volume
}
