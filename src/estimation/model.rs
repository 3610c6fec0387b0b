//! Log-linear signal model shared by every estimator
//!
//! For a non-baseline acquisition `i` with direction `g` the single-tensor
//! model is `S_i = S0 * exp(-b gᵀDg)`. Taking logs gives one linear equation
//! per direction, `ln(S0/S_i) = A_i · t`, with design row
//! `A_i = b * [gx², 2gxgy, 2gxgz, gy², 2gygz, gz²]` and
//! `t = [Dxx, Dxy, Dxz, Dyy, Dyz, Dzz]`.

use nalgebra::{DMatrix, DVector};

use crate::error::{DtiError, Result};
use crate::gradients::GradientTable;

/// Observations of one voxel that survived the validity checks
#[derive(Debug, Clone)]
pub struct Observations {
    /// Mean baseline signal
    pub s0: f64,
    /// Design-matrix rows (positions in the weighted-direction list) in use
    pub rows: Vec<usize>,
    /// Diffusion-weighted signal for each used row
    pub signal: Vec<f64>,
    /// `ln(S0 / S_i)` for each used row
    pub log_ratio: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SignalModel {
    baselines: Vec<usize>,
    weighted: Vec<usize>,
    design: DMatrix<f64>,
    pinv: DMatrix<f64>,
    threshold: f64,
    n_channels: usize,
}

impl SignalModel {
    pub fn new(gradients: &GradientTable, threshold: f64) -> Result<Self> {
        let baselines = gradients.baseline_indices();
        let weighted = gradients.weighted_indices();
        if baselines.is_empty() {
            return Err(DtiError::config("Gradient table has no baseline acquisition"));
        }
        if weighted.is_empty() {
            return Err(DtiError::config("Gradient table has no diffusion-weighted acquisition"));
        }

        let b = gradients.b_value();
        let design = DMatrix::from_fn(weighted.len(), 6, |r, c| {
            let g = gradients.direction(weighted[r]);
            let term = match c {
                0 => g.x * g.x,
                1 => 2.0 * g.x * g.y,
                2 => 2.0 * g.x * g.z,
                3 => g.y * g.y,
                4 => 2.0 * g.y * g.z,
                _ => g.z * g.z,
            };
            b * term
        });

        let svd = design.clone().svd(true, true);
        let eps = rank_tolerance(&svd.singular_values, design.nrows(), design.ncols());
        let pinv = svd.pseudo_inverse(eps).map_err(|e| {
            DtiError::config(format!("Cannot invert gradient design matrix: {}", e))
        })?;

        Ok(SignalModel {
            baselines,
            weighted,
            design,
            pinv,
            threshold,
            n_channels: gradients.len(),
        })
    }

    /// Collect the usable observations of one voxel
    ///
    /// Returns `None` when the voxel must not be fitted: baseline below the
    /// threshold, non-positive or non-finite baseline, or no valid
    /// diffusion-weighted signal left. Non-positive and non-finite weighted
    /// signals are dropped as missing data.
    pub fn observe(&self, sample: &[f64]) -> Option<Observations> {
        if sample.len() != self.n_channels {
            return None;
        }

        let s0 = self.baselines.iter().map(|&i| sample[i]).sum::<f64>()
            / self.baselines.len() as f64;
        if !s0.is_finite() || s0 <= 0.0 || s0 < self.threshold {
            return None;
        }

        let n = self.weighted.len();
        let mut obs = Observations {
            s0,
            rows: Vec::with_capacity(n),
            signal: Vec::with_capacity(n),
            log_ratio: Vec::with_capacity(n),
        };
        for (row, &channel) in self.weighted.iter().enumerate() {
            let si = sample[channel];
            if si.is_finite() && si > 0.0 {
                obs.rows.push(row);
                obs.signal.push(si);
                obs.log_ratio.push((s0 / si).ln());
            }
        }

        if obs.rows.is_empty() {
            None
        } else {
            Some(obs)
        }
    }

    /// `A_row · t`, i.e. `b gᵀDg` for the direction of `row`
    #[inline]
    pub fn exponent(&self, row: usize, t: &[f64; 6]) -> f64 {
        (0..6).map(|j| self.design[(row, j)] * t[j]).sum()
    }

    /// Predicted signal `S0 * exp(-A_row · t)`
    #[inline]
    pub fn predict(&self, s0: f64, row: usize, t: &[f64; 6]) -> f64 {
        s0 * (-self.exponent(row, t)).exp()
    }

    #[inline]
    pub fn design_entry(&self, row: usize, col: usize) -> f64 {
        self.design[(row, col)]
    }

    /// Ordinary least-squares fit of the log-linear system
    ///
    /// Uses the precomputed pseudo-inverse when every direction is usable,
    /// otherwise solves the reduced system. Rank-deficient designs yield the
    /// minimum-norm solution.
    pub fn solve_linear(&self, obs: &Observations) -> Option<[f64; 6]> {
        if obs.rows.len() == self.weighted.len() {
            let y = DVector::from_column_slice(&obs.log_ratio);
            let t = &self.pinv * y;
            return to_params(t.as_slice());
        }

        let a = DMatrix::from_fn(obs.rows.len(), 6, |r, c| self.design[(obs.rows[r], c)]);
        let y = DVector::from_column_slice(&obs.log_ratio);
        least_squares(a, y)
    }

    /// Weighted least-squares fit
    ///
    /// Minimizes `Σ w_i (A_i·t - y_i)²`, the solution of `AᵗWA·t = AᵗWy`,
    /// through an SVD of `√W·A`. Weights are normalized by their maximum.
    pub fn solve_weighted(&self, obs: &Observations, weights: &[f64]) -> Option<[f64; 6]> {
        let w_max = weights.iter().cloned().fold(0.0, f64::max);
        if !w_max.is_finite() || w_max <= 0.0 {
            return None;
        }
        let scale: Vec<f64> = weights.iter()
            .map(|&w| if w.is_finite() && w > 0.0 { (w / w_max).sqrt() } else { 0.0 })
            .collect();

        let a = DMatrix::from_fn(obs.rows.len(), 6, |r, c| {
            self.design[(obs.rows[r], c)] * scale[r]
        });
        let y = DVector::from_fn(obs.rows.len(), |r, _| obs.log_ratio[r] * scale[r]);
        least_squares(a, y)
    }
}

/// Singular values at or below this are treated as zero
fn rank_tolerance(singular_values: &DVector<f64>, nrows: usize, ncols: usize) -> f64 {
    let max_sv = singular_values.iter().cloned().fold(0.0, f64::max);
    max_sv * nrows.max(ncols) as f64 * f64::EPSILON
}

fn least_squares(a: DMatrix<f64>, y: DVector<f64>) -> Option<[f64; 6]> {
    let (nrows, ncols) = a.shape();
    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0, f64::max);
    if !max_sv.is_finite() || max_sv <= 0.0 {
        return None;
    }
    let eps = rank_tolerance(&svd.singular_values, nrows, ncols);
    let t = svd.solve(&y, eps).ok()?;
    to_params(t.as_slice())
}

fn to_params(values: &[f64]) -> Option<[f64; 6]> {
    if values.len() != 6 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut t = [0.0; 6];
    t.copy_from_slice(values);
    Some(t)
}
