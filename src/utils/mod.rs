//! Utility functions for tensor estimation
//!
//! - Baseline thresholding (Otsu)
//! - Inclusion / exclusion masking

pub mod threshold;
pub mod mask;

pub use threshold::*;
pub use mask::*;
