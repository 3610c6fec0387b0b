//! Nonlinear least-squares tensor estimation
//!
//! Starts from the linear estimate and minimizes `Σ (S_i - Ŝ_i)²` against
//! the raw signal, `Ŝ_i = S0 * exp(-b gᵢᵀDgᵢ)`, by gradient descent in tensor
//! parameter space.

use crate::error::Result;
use crate::gradients::GradientTable;
use crate::tensor::SymmetricTensor;

use super::descent::GradientDescent;
use super::model::{Observations, SignalModel};
use super::{tensor_or_zero, TensorEstimator};

#[derive(Debug, Clone)]
pub struct NonlinearEstimator {
    model: SignalModel,
    descent: GradientDescent,
}

impl NonlinearEstimator {
    pub fn new(
        gradients: &GradientTable,
        threshold: f64,
        descent: GradientDescent,
    ) -> Result<Self> {
        Ok(NonlinearEstimator {
            model: SignalModel::new(gradients, threshold)?,
            descent,
        })
    }
}

/// Sum of squared signal residuals and its gradient
pub(crate) fn squared_residuals(
    model: &SignalModel,
    obs: &Observations,
    t: &[f64; 6],
    grad: &mut [f64; 6],
) -> f64 {
    *grad = [0.0; 6];
    let mut f = 0.0;
    for (k, &row) in obs.rows.iter().enumerate() {
        let predicted = model.predict(obs.s0, row, t);
        let residual = obs.signal[k] - predicted;
        f += residual * residual;
        // d/dt of residual² = 2 * residual * predicted * A_row
        let coef = 2.0 * residual * predicted;
        for (j, g) in grad.iter_mut().enumerate() {
            *g += coef * model.design_entry(row, j);
        }
    }
    f
}

impl TensorEstimator for NonlinearEstimator {
    fn estimate(&self, sample: &[f64]) -> SymmetricTensor {
        let Some(obs) = self.model.observe(sample) else {
            return SymmetricTensor::ZERO;
        };
        let Some(init) = self.model.solve_linear(&obs) else {
            return SymmetricTensor::ZERO;
        };

        let t = self.descent.minimize(init, |t, grad| {
            squared_residuals(&self.model, &obs, t, grad)
        });
        tensor_or_zero(t)
    }
}
