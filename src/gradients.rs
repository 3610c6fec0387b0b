//! Diffusion gradient table
//!
//! Holds one diffusion-sensitizing direction per acquisition together with
//! the shared b-value. A direction with all three components exactly zero
//! marks a baseline (non-diffusion-weighted) acquisition. Directions are
//! not required to be unit length: the effective b-value of acquisition `i`
//! is `b * |g_i|²`.

use nalgebra::{Matrix3, Vector3};

use crate::error::{DtiError, Result};

/// Largest acquisition count a table may hold
///
/// A 4D NIfTI-1 volume stores its channel count in an `i16`.
pub const MAX_ACQUISITIONS: usize = i16::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    b_value: f64,
    directions: Vec<Vector3<f64>>,
}

impl GradientTable {
    /// Create an empty table for the given b-value
    pub fn new(b_value: f64) -> Result<Self> {
        if !b_value.is_finite() || b_value <= 0.0 {
            return Err(DtiError::config(format!("Invalid b-value: {}", b_value)));
        }
        Ok(GradientTable { b_value, directions: Vec::new() })
    }

    /// Create a table from an ordered list of directions
    pub fn from_directions(b_value: f64, directions: &[[f64; 3]]) -> Result<Self> {
        let mut table = GradientTable::new(b_value)?;
        for (i, g) in directions.iter().enumerate() {
            table.insert(i, Vector3::new(g[0], g[1], g[2]))?;
        }
        Ok(table)
    }

    /// Store `direction` at `index`, growing the table if needed
    ///
    /// Indices skipped over while growing are filled with zero vectors; the
    /// metadata parser checks contiguity before handing a table out.
    /// Indices at or beyond [`MAX_ACQUISITIONS`] are rejected.
    pub fn insert(&mut self, index: usize, direction: Vector3<f64>) -> Result<()> {
        if index >= MAX_ACQUISITIONS {
            return Err(DtiError::config(format!(
                "Gradient index {} exceeds the limit of {} acquisitions",
                index, MAX_ACQUISITIONS
            )));
        }
        if index >= self.directions.len() {
            self.directions.resize(index + 1, Vector3::zeros());
        }
        self.directions[index] = direction;
        Ok(())
    }

    /// Repeat the direction at `index` so it occupies `count` contiguous slots
    ///
    /// Models repeated acquisitions (NEX): slots `index+1 .. index+count`
    /// receive copies of the direction at `index`.
    pub fn repeat(&mut self, index: usize, count: usize) -> Result<()> {
        let g = *self.directions.get(index).ok_or_else(|| {
            DtiError::config(format!("Cannot repeat missing gradient index {}", index))
        })?;
        let end = index
            .checked_add(count)
            .filter(|&end| end <= MAX_ACQUISITIONS)
            .ok_or_else(|| {
                DtiError::config(format!(
                    "Repeat count {} for gradient index {} exceeds the limit of {} acquisitions",
                    count, index, MAX_ACQUISITIONS
                ))
            })?;
        for i in index + 1..end {
            self.insert(i, g)?;
        }
        Ok(())
    }

    /// Multiply every direction by `transform` in place
    pub fn reorient(&mut self, transform: &Matrix3<f64>) {
        for g in self.directions.iter_mut() {
            *g = transform * *g;
        }
    }

    pub fn is_baseline(&self, index: usize) -> bool {
        let g = &self.directions[index];
        g.x == 0.0 && g.y == 0.0 && g.z == 0.0
    }

    pub fn b_value(&self) -> f64 {
        self.b_value
    }

    pub fn len(&self) -> usize {
        self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.is_empty()
    }

    pub fn direction(&self, index: usize) -> &Vector3<f64> {
        &self.directions[index]
    }

    pub fn directions(&self) -> &[Vector3<f64>] {
        &self.directions
    }

    pub fn baseline_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_baseline(i)).collect()
    }

    pub fn weighted_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| !self.is_baseline(i)).collect()
    }
}
