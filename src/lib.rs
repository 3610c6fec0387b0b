//! DTI-Core: Diffusion tensor estimation from diffusion-weighted MRI
//!
//! This crate estimates a symmetric 3x3 diffusion tensor at every voxel of a
//! multi-directional diffusion-weighted volume.
//!
//! # Modules
//! - `gradients`: Gradient table (b-value + directions) and reorientation
//! - `metadata`: DWI header dictionaries and FSL bval/bvec parsing
//! - `volume`: Spatial grids, DWI volumes, masks
//! - `tensor`: Symmetric tensor type and tensor volumes
//! - `estimation`: Linear, weighted, nonlinear and Rician ML estimators
//! - `idwi`: Isotropic diffusion-weighted image
//! - `utils`: Otsu thresholding, voxel masking
//! - `pipeline`: End-to-end estimation run
//! - `nifti_io`: NIfTI reading and writing

pub mod error;

// Data model
pub mod gradients;
pub mod metadata;
pub mod tensor;
pub mod volume;

// Algorithm modules
pub mod estimation;
pub mod idwi;
pub mod pipeline;
pub mod utils;

// I/O modules
pub mod nifti_io;

pub use error::{DtiError, Result};
pub use estimation::{EstimationMethod, Estimator, EstimatorParams, TensorEstimator};
pub use gradients::GradientTable;
pub use metadata::DwiHeader;
pub use pipeline::{run_dti, DtiOutput, DtiParams, Masks};
pub use tensor::{SymmetricTensor, TensorVolume};
pub use volume::{DwiVolume, Grid, MaskVolume};
