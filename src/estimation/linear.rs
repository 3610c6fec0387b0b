//! Linear least-squares tensor estimation
//!
//! Closed-form fit of the log-linearized signal through the SVD
//! pseudo-inverse of the gradient design matrix.

use crate::error::Result;
use crate::gradients::GradientTable;
use crate::tensor::SymmetricTensor;

use super::model::SignalModel;
use super::{tensor_or_zero, TensorEstimator};

#[derive(Debug, Clone)]
pub struct LinearEstimator {
    model: SignalModel,
}

impl LinearEstimator {
    pub fn new(gradients: &GradientTable, threshold: f64) -> Result<Self> {
        Ok(LinearEstimator { model: SignalModel::new(gradients, threshold)? })
    }
}

impl TensorEstimator for LinearEstimator {
    fn estimate(&self, sample: &[f64]) -> SymmetricTensor {
        self.model
            .observe(sample)
            .and_then(|obs| self.model.solve_linear(&obs))
            .map(tensor_or_zero)
            .unwrap_or(SymmetricTensor::ZERO)
    }
}
