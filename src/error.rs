//! Error types for tensor estimation
//!
//! Every variant here is fatal for a run. Per-voxel numeric trouble
//! (singular fits, non-finite optimizer state) is not an error: the voxel
//! simply receives the zero tensor.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DtiError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Geometry mismatch: expected {expected}, found {found}")]
    GeometryMismatch { expected: String, found: String },

    #[error("IO error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("Metadata error on '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl DtiError {
    pub fn config(msg: impl Into<String>) -> Self {
        DtiError::Configuration(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DtiError::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, DtiError>;
