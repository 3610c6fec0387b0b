//! End-to-end tests: files in, tensor volume out

mod common;

use std::collections::BTreeMap;

use common::*;
use dti_core::metadata::{output_dictionary, read_dictionary, read_fsl, write_dictionary};
use dti_core::nifti_io::{
    read_dwi_file, read_nifti_file, save_nifti_to_file, save_tensor_to_file, INTENT_SYMMATRIX,
};
use dti_core::{run_dti, DtiError, DtiParams, DwiHeader, EstimationMethod, Masks, SymmetricTensor};

fn header_dictionary(n_baselines: usize, directions: &[[f64; 3]]) -> BTreeMap<String, String> {
    let mut dict = BTreeMap::new();
    dict.insert("modality".to_string(), "DWMRI".to_string());
    dict.insert("DWMRI_b-value".to_string(), "1000".to_string());
    dict.insert("DWMRI_gradient_0000".to_string(), "0 0 0".to_string());
    if n_baselines > 1 {
        dict.insert("DWMRI_NEX_0000".to_string(), n_baselines.to_string());
    }
    for (i, g) in directions.iter().enumerate() {
        dict.insert(
            format!("DWMRI_gradient_{:04}", n_baselines + i),
            format!("{} {} {}", g[0], g[1], g[2]),
        );
    }
    dict.insert(
        "NRRD_measurement frame".to_string(),
        "(1,0,0) (0,1,0) (0,0,1)".to_string(),
    );
    dict
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

#[test]
fn test_nifti_files_end_to_end() {
    let directions = spread_directions();
    let table = gradient_table(1000.0, 2, &directions);
    let truth = prolate_tensor();
    let samples: Vec<Vec<f64>> = (0..6)
        .map(|v| {
            if v == 5 {
                vec![3.0; table.len()]
            } else {
                synthetic_sample(1000.0, &table, &truth)
            }
        })
        .collect();
    let dwi = volume_from_samples(&samples);

    let dwi_path = temp_path("e2e_dwi.nii");
    let header_path = temp_path("e2e_header.json");
    let tensor_path = temp_path("e2e_tensors.nii");
    write_dwi_nifti(&dwi_path, &dwi);
    write_dictionary(&header_path, &header_dictionary(2, &directions)).unwrap();

    let dict = read_dictionary(&header_path).unwrap();
    let header = DwiHeader::from_dictionary(&dict).unwrap();
    assert_eq!(header.gradients.baseline_indices(), vec![0, 1]);

    let loaded = read_dwi_file(&dwi_path).unwrap();
    assert_eq!(loaded.n_channels, table.len());
    assert_eq!(loaded.grid.dims, (6, 1, 1));

    let params = DtiParams {
        compute_idwi: true,
        compute_threshold_mask: true,
        ..DtiParams::default()
    };
    let frame = loaded.grid.image_frame();
    let output = run_dti(loaded, &header, &Masks::default(), &params).unwrap();

    // f32 storage limits accuracy
    for v in 0..5 {
        assert!(max_component_error(&output.tensors.tensors[v], &truth) < 1e-6, "voxel {}", v);
    }
    assert!(output.tensors.tensors[5].is_zero());
    assert_eq!(output.threshold_mask.as_deref(), Some(&[1u8, 1, 1, 1, 1, 0][..]));
    assert!(output.idwi.as_ref().unwrap()[0] > 0.0);

    save_tensor_to_file(&tensor_path, &output.tensors).unwrap();
    let bytes = std::fs::read(&tensor_path).unwrap();
    let dim: Vec<i16> = (0..6)
        .map(|i| i16::from_le_bytes([bytes[40 + 2 * i], bytes[41 + 2 * i]]))
        .collect();
    assert_eq!(dim, vec![5, 6, 1, 1, 1, 6]);
    assert_eq!(i16::from_le_bytes([bytes[68], bytes[69]]), INTENT_SYMMATRIX);
    // Component planes in lower-triangular order: xx, xy, yy, xz, yz, zz
    let n = 6;
    let expected = truth.lower_triangular();
    for (c, &value) in expected.iter().enumerate() {
        let stored = read_f32(&bytes, 352 + 4 * (c * n)) as f64;
        assert!((stored - value).abs() < 1e-6, "component {}: {} vs {}", c, stored, value);
    }

    let sidecar = output_dictionary(&dict, &frame);
    assert_eq!(sidecar["modality"], "DTMRI");
    assert_eq!(sidecar["NRRD_measurement frame"], "(1,0,0) (0,1,0) (0,0,1)");

    for path in [dwi_path, header_path, tensor_path] {
        std::fs::remove_file(path).ok();
    }
}

#[test]
fn test_fsl_two_direction_example() {
    let bvals_path = temp_path("example.bval");
    let bvecs_path = temp_path("example.bvec");
    std::fs::write(&bvals_path, "0 1000 1000\n").unwrap();
    std::fs::write(&bvecs_path, "0 1 0\n0 0 1\n0 0 0\n").unwrap();
    let header = read_fsl(&bvals_path, &bvecs_path).unwrap();

    let dwi = volume_from_samples(&[vec![1000.0, 606.0, 606.0]]);
    let output = run_dti(dwi, &header, &Masks::default(), &DtiParams::default()).unwrap();

    let t = output.tensors.tensors[0];
    assert!((t.xx() - 0.0005).abs() < 1e-5);
    assert!((t.yy() - 0.0005).abs() < 1e-5);
    assert!(t.zz().abs() < 1e-12);
    assert!(t.xy().abs() < 1e-12 && t.xz().abs() < 1e-12 && t.yz().abs() < 1e-12);

    std::fs::remove_file(bvals_path).ok();
    std::fs::remove_file(bvecs_path).ok();
}

#[test]
fn test_mask_files_restrict_estimation() {
    let table = gradient_table(1000.0, 1, &spread_directions());
    let samples: Vec<Vec<f64>> = (0..4)
        .map(|_| synthetic_sample(1000.0, &table, &prolate_tensor()))
        .collect();
    let dwi = volume_from_samples(&samples);
    let grid = dwi.grid.clone();

    let brain_path = temp_path("brain_mask.nii.gz");
    let bad_path = temp_path("bad_region.nii");
    save_nifti_to_file(&brain_path, &[1.0, 1.0, 1.0, 0.0], &grid).unwrap();
    save_nifti_to_file(&bad_path, &[0.0, 1.0, 0.0, 0.0], &grid).unwrap();

    let masks = Masks {
        inclusion: Some(read_nifti_file(&brain_path).unwrap().into_mask().unwrap()),
        exclusion: Some(read_nifti_file(&bad_path).unwrap().into_mask().unwrap()),
    };
    let header = DwiHeader { gradients: table, measurement_frame: None };
    let params = DtiParams {
        estimator: dti_core::EstimatorParams {
            method: EstimationMethod::Nonlinear,
            ..Default::default()
        },
        ..DtiParams::default()
    };
    let output = run_dti(dwi, &header, &masks, &params).unwrap();

    let estimated: Vec<bool> = output.tensors.tensors.iter().map(|t| !t.is_zero()).collect();
    assert_eq!(estimated, vec![true, false, true, false]);
    assert_eq!(output.tensors.estimated_count(), 2);
    assert_eq!(output.empty_voxels, 2);

    std::fs::remove_file(brain_path).ok();
    std::fs::remove_file(bad_path).ok();
}

#[test]
fn test_mask_on_other_grid_is_rejected() {
    let table = gradient_table(1000.0, 1, &spread_directions());
    let sample = synthetic_sample(1000.0, &table, &SymmetricTensor::ZERO);
    let dwi = volume_from_samples(&vec![sample; 2]);
    let mut grid = dwi.grid.clone();
    grid.affine[3] = 5.0;
    let mask = dti_core::MaskVolume::new(grid, vec![1.0, 1.0]).unwrap();

    let header = DwiHeader { gradients: table, measurement_frame: None };
    let masks = Masks { inclusion: Some(mask), exclusion: None };
    match run_dti(dwi, &header, &masks, &DtiParams::default()) {
        Err(DtiError::GeometryMismatch { .. }) => {}
        other => panic!("expected geometry mismatch, got {:?}", other.map(|o| o.threshold)),
    }
}

#[test]
fn test_ml_without_sigma_fails_before_estimation() {
    let table = gradient_table(1000.0, 1, &spread_directions());
    let dwi = volume_from_samples(&[synthetic_sample(1000.0, &table, &prolate_tensor())]);
    let header = DwiHeader { gradients: table, measurement_frame: None };
    let mut params = DtiParams::default();
    params.estimator.method = "ml".parse().unwrap();

    let err = run_dti(dwi, &header, &Masks::default(), &params).unwrap_err();
    assert!(err.to_string().contains("sigma"), "{}", err);
}
