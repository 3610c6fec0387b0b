//! Gradient descent over the six tensor parameters
//!
//! Each voxel builds its own [`GradientDescent::minimize`] call on the stack;
//! nothing is shared between voxels except the read-only settings.

/// Halvings tried before a step is declared impossible
const MAX_BACKTRACKS: usize = 60;

/// Step multiplier after an accepted step
const STEP_GROWTH: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientDescent {
    /// Initial step size
    pub step: f64,
    /// Maximum number of accepted steps
    pub max_iterations: usize,
    /// Stop when an accepted step improves the objective by less than this
    /// fraction of its magnitude
    pub tolerance: f64,
}

impl Default for GradientDescent {
    fn default() -> Self {
        GradientDescent {
            step: 1.0e-8,
            max_iterations: 1000,
            tolerance: 1.0e-14,
        }
    }
}

impl GradientDescent {
    /// Minimize `objective` starting from `x0`
    ///
    /// `objective(x, grad)` returns the objective value at `x` and writes its
    /// gradient into `grad`. A trial point is accepted only if its value and
    /// gradient are finite and the value decreases; otherwise the step is
    /// halved. Accepted steps grow the step for the next iteration, so the
    /// initial step only sets the starting scale.
    ///
    /// # Returns
    /// The best point found; `x0` itself when it cannot be evaluated.
    pub fn minimize<F>(&self, x0: [f64; 6], mut objective: F) -> [f64; 6]
    where
        F: FnMut(&[f64; 6], &mut [f64; 6]) -> f64,
    {
        let mut x = x0;
        let mut grad = [0.0; 6];
        let mut f = objective(&x, &mut grad);
        if !f.is_finite() || !all_finite(&grad) {
            return x0;
        }

        let mut step = self.step;
        let mut trial = [0.0; 6];
        let mut trial_grad = [0.0; 6];

        for _ in 0..self.max_iterations {
            let grad_norm_sq: f64 = grad.iter().map(|g| g * g).sum();
            if grad_norm_sq == 0.0 {
                break;
            }

            let mut decrease = None;
            for _ in 0..MAX_BACKTRACKS {
                for j in 0..6 {
                    trial[j] = x[j] - step * grad[j];
                }
                let f_trial = objective(&trial, &mut trial_grad);
                if f_trial.is_finite() && f_trial < f && all_finite(&trial_grad) {
                    decrease = Some(f - f_trial);
                    x = trial;
                    grad = trial_grad;
                    f = f_trial;
                    break;
                }
                step *= 0.5;
            }

            match decrease {
                None => break,
                Some(d) => {
                    if d <= self.tolerance * f.abs().max(f64::MIN_POSITIVE) {
                        break;
                    }
                    step *= STEP_GROWTH;
                }
            }
        }

        x
    }
}

#[inline]
fn all_finite(values: &[f64; 6]) -> bool {
    values.iter().all(|v| v.is_finite())
}
