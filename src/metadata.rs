//! DWI header metadata
//!
//! Turns the key/value dictionary that accompanies a diffusion-weighted
//! volume into an indexed [`GradientTable`] in one structured step, so the
//! estimation code never deals with string keys. Two sources are supported:
//!
//! - NRRD-style dictionaries (`DWMRI_b-value`, `DWMRI_gradient_NNNN`,
//!   `DWMRI_NEX_NNNN`, `NRRD_measurement frame`), stored as a JSON object
//! - FSL `bval` / `bvec` text files
//!
//! World coordinates are RAS throughout. The image frame is taken from the
//! NIfTI sform, so a measurement frame must map gradient coordinates to RAS.
//! A frame copied from an LPS header (NRRD `space: left-posterior-superior`)
//! needs its first two rows negated first. The output sidecar's frame is
//! written in RAS as well.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use nalgebra::{Matrix3, Vector3};

use crate::error::{DtiError, Result};
use crate::gradients::GradientTable;

pub const B_VALUE_KEY: &str = "DWMRI_b-value";
pub const GRADIENT_PREFIX: &str = "DWMRI_gradient_";
pub const NEX_PREFIX: &str = "DWMRI_NEX_";
pub const MEASUREMENT_FRAME_KEY: &str = "NRRD_measurement frame";
pub const MODALITY_KEY: &str = "modality";

const MEASUREMENT_FRAME_ALIASES: [&str; 2] = [MEASUREMENT_FRAME_KEY, "measurement frame"];

/// Parsed gradient information of a DWI acquisition
#[derive(Debug, Clone)]
pub struct DwiHeader {
    pub gradients: GradientTable,
    /// Frame the gradients were recorded in (columns are the frame axes)
    pub measurement_frame: Option<Matrix3<f64>>,
}

impl DwiHeader {
    /// Parse an NRRD-style key/value dictionary
    pub fn from_dictionary(dict: &BTreeMap<String, String>) -> Result<Self> {
        let b_value = match dict.get(B_VALUE_KEY) {
            Some(v) => parse_number(B_VALUE_KEY, v)?,
            None => return Err(DtiError::config("b-value not specified in header")),
        };
        let mut gradients = GradientTable::new(b_value)?;
        let mut assigned = BTreeSet::new();

        for (key, value) in dict {
            if let Some(suffix) = key.strip_prefix(GRADIENT_PREFIX) {
                let index = parse_index(key, suffix)?;
                gradients.insert(index, parse_direction(key, value)?)?;
                assigned.insert(index);
            }
        }

        // Repeats refer to directions, so they are expanded once all
        // directions are known.
        for (key, value) in dict {
            if let Some(suffix) = key.strip_prefix(NEX_PREFIX) {
                let index = parse_index(key, suffix)?;
                let count: usize = value.trim().parse().map_err(|_| {
                    DtiError::config(format!("Invalid repeat count for {}: '{}'", key, value))
                })?;
                // Bounded by the repeat succeeding
                gradients.repeat(index, count)?;
                assigned.extend(index..index + count.max(1));
            }
        }

        if gradients.is_empty() {
            return Err(DtiError::config("No gradient directions in header"));
        }
        if let Some(missing) = (0..gradients.len()).find(|i| !assigned.contains(i)) {
            return Err(DtiError::config(format!(
                "Gradient index {} missing from header ({} directions)",
                missing, gradients.len()
            )));
        }

        let measurement_frame = MEASUREMENT_FRAME_ALIASES
            .iter()
            .find_map(|k| dict.get(*k))
            .map(|v| parse_frame(v))
            .transpose()?;

        Ok(DwiHeader { gradients, measurement_frame })
    }

    /// Parse FSL `bval` / `bvec` file contents
    ///
    /// The b-value of the table is the largest bval; each direction is scaled
    /// by `sqrt(bval / bmax)` so its effective b-value is preserved. `bvec`
    /// may be stored as 3 rows of N values or N rows of 3 values.
    pub fn from_fsl(bvals: &str, bvecs: &str) -> Result<Self> {
        let bvals: Vec<f64> = parse_numbers("bvals", bvals)?;
        if bvals.is_empty() {
            return Err(DtiError::config("bvals file is empty"));
        }
        let n = bvals.len();

        let rows: Vec<Vec<f64>> = bvecs
            .lines()
            .map(|line| parse_numbers("bvecs", line))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|row| !row.is_empty())
            .collect();

        let vectors: Vec<Vector3<f64>> = if rows.len() == 3 && rows.iter().all(|r| r.len() == n) {
            (0..n).map(|i| Vector3::new(rows[0][i], rows[1][i], rows[2][i])).collect()
        } else if rows.len() == n && rows.iter().all(|r| r.len() == 3) {
            rows.iter().map(|r| Vector3::new(r[0], r[1], r[2])).collect()
        } else {
            return Err(DtiError::config(format!(
                "bvecs layout does not match {} bvals", n
            )));
        };

        let b_max = bvals.iter().cloned().fold(0.0, f64::max);
        let mut gradients = GradientTable::new(b_max)?;
        for (i, (g, &b)) in vectors.iter().zip(bvals.iter()).enumerate() {
            let direction = if b > 0.0 { g * (b / b_max).sqrt() } else { Vector3::zeros() };
            gradients.insert(i, direction)?;
        }

        Ok(DwiHeader { gradients, measurement_frame: None })
    }

    /// Transform taking gradients into the image coordinate frame
    ///
    /// `inverse(image_frame) * measurement_frame`, or identity when the header
    /// carries no measurement frame.
    pub fn reorientation(&self, image_frame: &Matrix3<f64>) -> Result<Matrix3<f64>> {
        match &self.measurement_frame {
            None => Ok(Matrix3::identity()),
            Some(mf) => {
                let inverse = image_frame.try_inverse().ok_or_else(|| {
                    DtiError::config("Image direction matrix is singular")
                })?;
                Ok(inverse * mf)
            }
        }
    }

    /// Dictionary form of the header, for inputs that came without one
    pub fn to_dictionary(&self) -> BTreeMap<String, String> {
        let mut dict = BTreeMap::new();
        dict.insert(MODALITY_KEY.to_string(), "DWMRI".to_string());
        dict.insert(B_VALUE_KEY.to_string(), self.gradients.b_value().to_string());
        for (i, g) in self.gradients.directions().iter().enumerate() {
            dict.insert(
                format!("{}{:04}", GRADIENT_PREFIX, i),
                format!("{} {} {}", g[0], g[1], g[2]),
            );
        }
        if let Some(frame) = &self.measurement_frame {
            dict.insert(MEASUREMENT_FRAME_KEY.to_string(), format_frame(frame));
        }
        dict
    }
}

/// Dictionary to attach to the tensor output
///
/// Gradients are reoriented into the image frame before estimation, so the
/// measurement frame of the output becomes the image frame itself.
pub fn output_dictionary(
    input: &BTreeMap<String, String>,
    image_frame: &Matrix3<f64>,
) -> BTreeMap<String, String> {
    let mut out = input.clone();
    for key in MEASUREMENT_FRAME_ALIASES {
        if out.contains_key(key) {
            out.insert(key.to_string(), format_frame(image_frame));
        }
    }
    if out.contains_key(MODALITY_KEY) {
        out.insert(MODALITY_KEY.to_string(), "DTMRI".to_string());
    }
    out
}

/// Read a JSON object of string values
pub fn read_dictionary(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path).map_err(|e| DtiError::io(path, e))?;
    serde_json::from_str(&text).map_err(|source| DtiError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_dictionary(path: &Path, dict: &BTreeMap<String, String>) -> Result<()> {
    let text = serde_json::to_string_pretty(dict).map_err(|source| DtiError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, text).map_err(|e| DtiError::io(path, e))
}

/// Read FSL gradient files from disk
pub fn read_fsl(bvals_path: &Path, bvecs_path: &Path) -> Result<DwiHeader> {
    let bvals = std::fs::read_to_string(bvals_path).map_err(|e| DtiError::io(bvals_path, e))?;
    let bvecs = std::fs::read_to_string(bvecs_path).map_err(|e| DtiError::io(bvecs_path, e))?;
    DwiHeader::from_fsl(&bvals, &bvecs)
}

fn parse_number(key: &str, value: &str) -> Result<f64> {
    value.trim().parse().map_err(|_| {
        DtiError::config(format!("Invalid number for {}: '{}'", key, value))
    })
}

fn parse_numbers(what: &str, text: &str) -> Result<Vec<f64>> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(what, s))
        .collect()
}

fn parse_index(key: &str, suffix: &str) -> Result<usize> {
    suffix.trim().parse().map_err(|_| {
        DtiError::config(format!("Invalid index in header key '{}'", key))
    })
}

fn parse_direction(key: &str, value: &str) -> Result<Vector3<f64>> {
    let v = parse_numbers(key, value)?;
    if v.len() != 3 {
        return Err(DtiError::config(format!(
            "Expected 3 components for {}, got {}", key, v.len()
        )));
    }
    Ok(Vector3::new(v[0], v[1], v[2]))
}

/// Parse `(a,b,c) (d,e,f) (g,h,i)`; vector `j` becomes column `j`
fn parse_frame(value: &str) -> Result<Matrix3<f64>> {
    let columns: Vec<Vector3<f64>> = value
        .split(')')
        .map(|part| part.trim().trim_start_matches('('))
        .filter(|part| !part.is_empty())
        .map(|part| parse_direction(MEASUREMENT_FRAME_KEY, part))
        .collect::<Result<_>>()?;
    if columns.len() != 3 {
        return Err(DtiError::config(format!(
            "Measurement frame needs 3 vectors, got {}", columns.len()
        )));
    }
    Ok(Matrix3::from_columns(&columns))
}

fn format_frame(frame: &Matrix3<f64>) -> String {
    (0..3)
        .map(|j| {
            let c = frame.column(j);
            format!("({},{},{})", c[0], c[1], c[2])
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_dictionary() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_gradient_0001", "1 0 0"),
            ("DWMRI_gradient_0002", "  0 1 0 "),
            ("modality", "DWMRI"),
        ]);
        let header = DwiHeader::from_dictionary(&d).unwrap();
        assert_eq!(header.gradients.b_value(), 1000.0);
        assert_eq!(header.gradients.len(), 3);
        assert!(header.gradients.is_baseline(0));
        assert_eq!(*header.gradients.direction(2), Vector3::new(0.0, 1.0, 0.0));
        assert!(header.measurement_frame.is_none());
    }

    #[test]
    fn test_missing_b_value_is_configuration_error() {
        let d = dict(&[("DWMRI_gradient_0000", "0 0 0")]);
        match DwiHeader::from_dictionary(&d) {
            Err(DtiError::Configuration(msg)) => assert!(msg.contains("b-value")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_nex_expansion() {
        let d = dict(&[
            ("DWMRI_b-value", "800"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_NEX_0000", "2"),
            ("DWMRI_gradient_0002", "0 0 1"),
            ("DWMRI_NEX_0002", "3"),
        ]);
        let header = DwiHeader::from_dictionary(&d).unwrap();
        assert_eq!(header.gradients.len(), 5);
        assert_eq!(header.gradients.baseline_indices(), vec![0, 1]);
        assert_eq!(header.gradients.weighted_indices(), vec![2, 3, 4]);
    }

    #[test]
    fn test_overflowing_nex_is_configuration_error() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_gradient_0001", "1 0 0"),
            ("DWMRI_NEX_0001", "18446744073709551615"),
        ]);
        match DwiHeader::from_dictionary(&d) {
            Err(DtiError::Configuration(msg)) => assert!(msg.contains("Repeat count"), "{}", msg),
            other => panic!("expected configuration error, got {:?}", other),
        }

        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_NEX_0000", "40000"),
        ]);
        assert!(matches!(DwiHeader::from_dictionary(&d), Err(DtiError::Configuration(_))));
    }

    #[test]
    fn test_huge_gradient_index_is_configuration_error() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_gradient_99999999999", "1 0 0"),
        ]);
        match DwiHeader::from_dictionary(&d) {
            Err(DtiError::Configuration(msg)) => assert!(msg.contains("exceeds"), "{}", msg),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_in_indices_is_rejected() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("DWMRI_gradient_0002", "1 0 0"),
        ]);
        assert!(DwiHeader::from_dictionary(&d).is_err());
    }

    #[test]
    fn test_bad_direction_is_rejected() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0"),
        ]);
        assert!(DwiHeader::from_dictionary(&d).is_err());
    }

    #[test]
    fn test_measurement_frame_columns() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("NRRD_measurement frame", "(0,1,0) (-1,0,0) (0,0,1)"),
        ]);
        let header = DwiHeader::from_dictionary(&d).unwrap();
        let mf = header.measurement_frame.unwrap();
        assert_eq!(mf.column(0).into_owned(), Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(mf.column(1).into_owned(), Vector3::new(-1.0, 0.0, 0.0));

        // Identity image frame: transform is the measurement frame itself
        let t = header.reorientation(&Matrix3::identity()).unwrap();
        assert_eq!(t, mf);

        // Image frame equal to measurement frame: gradients already aligned
        let t = header.reorientation(&mf).unwrap();
        assert!((t - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn test_frame_is_relative_to_ras_image_axes() {
        // Gradients recorded in RAS; the image axes point left and posterior
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("DWMRI_gradient_0000", "0 0 0"),
            ("NRRD_measurement frame", "(1,0,0) (0,1,0) (0,0,1)"),
        ]);
        let header = DwiHeader::from_dictionary(&d).unwrap();
        let affine = [
            -2.0, 0.0, 0.0, 90.0,
            0.0, -2.0, 0.0, 126.0,
            0.0, 0.0, 2.0, -72.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        let grid = crate::volume::Grid::new((4, 4, 4), (2.0, 2.0, 2.0), affine);
        let t = header.reorientation(&grid.image_frame()).unwrap();
        let g = t * Vector3::new(1.0, 0.0, 0.0);
        assert!((g - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-12);
        let g = t * Vector3::new(0.0, 0.0, 1.0);
        assert!((g - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-12);
    }

    #[test]
    fn test_output_dictionary_rewrites_frame_and_modality() {
        let d = dict(&[
            ("DWMRI_b-value", "1000"),
            ("NRRD_measurement frame", "(0,1,0) (-1,0,0) (0,0,1)"),
            ("modality", "DWMRI"),
        ]);
        let out = output_dictionary(&d, &Matrix3::identity());
        assert_eq!(out["modality"], "DTMRI");
        assert_eq!(out["NRRD_measurement frame"], "(1,0,0) (0,1,0) (0,0,1)");
        assert_eq!(out["DWMRI_b-value"], "1000");

        let plain = output_dictionary(&dict(&[("DWMRI_b-value", "1000")]), &Matrix3::identity());
        assert!(!plain.contains_key("modality"));
    }

    #[test]
    fn test_to_dictionary_parses_back() {
        let header = DwiHeader::from_fsl("0 1000 1000", "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        let d = header.to_dictionary();
        assert_eq!(d["DWMRI_gradient_0001"], "1 0 0");
        let parsed = DwiHeader::from_dictionary(&d).unwrap();
        assert_eq!(parsed.gradients, header.gradients);
        assert_eq!(output_dictionary(&d, &Matrix3::identity())["modality"], "DTMRI");
    }

    #[test]
    fn test_fsl_three_rows() {
        let bvals = "0 1000 1000 500\n";
        let bvecs = "0 1 0 0\n0 0 1 0\n0 0 0 1\n";
        let header = DwiHeader::from_fsl(bvals, bvecs).unwrap();
        let g = &header.gradients;
        assert_eq!(g.b_value(), 1000.0);
        assert_eq!(g.len(), 4);
        assert!(g.is_baseline(0));
        assert_eq!(*g.direction(1), Vector3::new(1.0, 0.0, 0.0));
        // b=500 on a b=1000 table: |g|² = 0.5
        assert!((g.direction(3).norm_squared() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fsl_transposed_layout() {
        let bvals = "0\n1000\n1000";
        let bvecs = "0 0 0\n1 0 0\n0 1 0\n";
        let header = DwiHeader::from_fsl(bvals, bvecs).unwrap();
        assert_eq!(header.gradients.weighted_indices(), vec![1, 2]);
    }

    #[test]
    fn test_fsl_mismatched_lengths() {
        assert!(DwiHeader::from_fsl("0 1000", "0 1 0\n0 0 1\n0 0 0\n").is_err());
        assert!(DwiHeader::from_fsl("0 0", "0 0\n0 0\n0 0\n").is_err());
    }

    #[test]
    fn test_dictionary_file_roundtrip() {
        let d = dict(&[("DWMRI_b-value", "1000"), ("modality", "DTMRI")]);
        let path = std::env::temp_dir().join("test_dti_dictionary.json");
        write_dictionary(&path, &d).unwrap();
        assert_eq!(read_dictionary(&path).unwrap(), d);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_missing_dictionary_reports_path() {
        let err = read_dictionary(Path::new("/tmp/nonexistent_dti_header_12345.json")).unwrap_err();
        assert!(err.to_string().contains("nonexistent_dti_header_12345"));
    }
}
