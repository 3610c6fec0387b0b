//! Iteratively reweighted least-squares tensor estimation
//!
//! The log transform makes the noise on `ln(S0/S_i)` scale with `1/S_i`.
//! After an initial fit, every observation is reweighted by the square of
//! the signal predicted from the current tensor and the weighted normal
//! equations are solved again.

use crate::error::Result;
use crate::gradients::GradientTable;
use crate::tensor::SymmetricTensor;

use super::model::{Observations, SignalModel};
use super::{tensor_or_zero, TensorEstimator};

/// Weights used for the first fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialWeights {
    /// Unit weights: the first fit is the linear estimate
    #[default]
    Uniform,
    /// Squared measured signal
    SignalMagnitude,
}

#[derive(Debug, Clone)]
pub struct WeightedEstimator {
    model: SignalModel,
    iterations: usize,
    tolerance: Option<f64>,
    initial: InitialWeights,
}

impl WeightedEstimator {
    /// # Arguments
    /// * `iterations` - Number of reweighting passes after the initial fit
    /// * `tolerance` - Optional early stop on relative tensor change
    /// * `initial` - Weights of the initial fit
    pub fn new(
        gradients: &GradientTable,
        threshold: f64,
        iterations: usize,
        tolerance: Option<f64>,
        initial: InitialWeights,
    ) -> Result<Self> {
        Ok(WeightedEstimator {
            model: SignalModel::new(gradients, threshold)?,
            iterations,
            tolerance,
            initial,
        })
    }

    fn initial_fit(&self, obs: &Observations) -> Option<[f64; 6]> {
        match self.initial {
            InitialWeights::Uniform => self.model.solve_linear(obs),
            InitialWeights::SignalMagnitude => {
                let weights: Vec<f64> = obs.signal.iter().map(|s| s * s).collect();
                self.model.solve_weighted(obs, &weights)
            }
        }
    }
}

impl TensorEstimator for WeightedEstimator {
    fn estimate(&self, sample: &[f64]) -> SymmetricTensor {
        let Some(obs) = self.model.observe(sample) else {
            return SymmetricTensor::ZERO;
        };
        let Some(mut t) = self.initial_fit(&obs) else {
            return SymmetricTensor::ZERO;
        };

        for _ in 0..self.iterations {
            let weights: Vec<f64> = obs.rows.iter()
                .map(|&row| self.model.predict(obs.s0, row, &t).powi(2))
                .collect();
            let Some(next) = self.model.solve_weighted(&obs, &weights) else {
                break;
            };
            let change = relative_change(&t, &next);
            t = next;
            if self.tolerance.is_some_and(|tol| change <= tol) {
                break;
            }
        }

        tensor_or_zero(t)
    }
}

fn relative_change(old: &[f64; 6], new: &[f64; 6]) -> f64 {
    let diff: f64 = old.iter().zip(new).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt();
    let norm: f64 = old.iter().map(|a| a * a).sum::<f64>().sqrt();
    if norm > 0.0 { diff / norm } else { diff }
}
