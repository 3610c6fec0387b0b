//! dtiestim: estimate a diffusion tensor volume from a DWI volume
//!
//! Usage:
//!   dtiestim dwi.nii.gz tensors.nii.gz --header dwi.json
//!   dtiestim dwi.nii.gz tensors.nii.gz --bvals dwi.bval --bvecs dwi.bvec -m wls

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, Level};

use dti_core::metadata::{output_dictionary, read_dictionary, read_fsl, write_dictionary};
use dti_core::nifti_io::{read_dwi_file, read_nifti_file, save_nifti_to_file, save_tensor_to_file};
use dti_core::pipeline::{run_dti, DtiParams, Masks};
use dti_core::{DtiError, DwiHeader, EstimationMethod, EstimatorParams, MaskVolume, Result};

#[derive(Parser, Debug)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "Estimate diffusion tensors from a diffusion-weighted image",
    long_about = None
)]
struct Args {
    #[arg(help = "Diffusion-weighted image (4D NIfTI, .nii or .nii.gz)")]
    dwi_image: PathBuf,

    #[arg(help = "Output tensor image (NIfTI symmetric-matrix volume)")]
    tensor_output: PathBuf,

    #[arg(
        long,
        help = "JSON dictionary with DWMRI_* gradient keys",
        conflicts_with_all = ["bvals", "bvecs"],
    )]
    header: Option<PathBuf>,

    #[arg(long, requires = "bvecs", help = "FSL b-value file")]
    bvals: Option<PathBuf>,

    #[arg(long, requires = "bvals", help = "FSL gradient direction file")]
    bvecs: Option<PathBuf>,

    #[arg(short = 'M', long = "brain-mask", help = "Only estimate where this mask is non-zero")]
    brain_mask: Option<PathBuf>,

    #[arg(short = 'B', long = "bad-region-mask", help = "Skip voxels where this mask is positive")]
    bad_region_mask: Option<PathBuf>,

    #[arg(
        short = 't',
        long,
        help = "Baseline threshold (default: 0.9 x Otsu threshold of the baseline)",
    )]
    threshold: Option<f64>,

    #[arg(long, help = "Write the isotropic DWI (geometric mean of weighted channels)")]
    idwi: Option<PathBuf>,

    #[arg(long = "threshold-mask", help = "Write the baseline threshold mask")]
    threshold_mask: Option<PathBuf>,

    #[arg(
        short = 'm',
        long,
        default_value = "lls",
        help = "Estimation method: lls, wls, nls or ml",
    )]
    method: String,

    #[arg(long = "weight-iterations", default_value_t = 1, help = "Reweighting passes for wls")]
    weight_iterations: usize,

    #[arg(
        long = "weight-tolerance",
        help = "Stop wls early once the relative tensor change drops below this",
    )]
    weight_tolerance: Option<f64>,

    #[arg(
        short = 's',
        long,
        default_value_t = 1.0e-8,
        help = "Initial gradient descent step for nls and ml",
    )]
    step: f64,

    #[arg(long, help = "Rician noise level, required for ml")]
    sigma: Option<f64>,

    #[arg(
        long = "max-iterations",
        default_value_t = 1000,
        help = "Gradient descent iteration budget for nls and ml",
    )]
    max_iterations: usize,

    #[arg(short = 'v', long = "verbose", help = "Enable verbose logging")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .finish(),
    ) {
        eprintln!("[ERROR] Could not set up logging: {}", e);
    }

    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn params_from_args(args: &Args) -> Result<DtiParams> {
    let method: EstimationMethod = args.method.parse()?;
    Ok(DtiParams {
        estimator: EstimatorParams {
            method,
            weight_iterations: args.weight_iterations,
            weight_tolerance: args.weight_tolerance,
            step: args.step,
            max_iterations: args.max_iterations,
            sigma: args.sigma,
            ..EstimatorParams::default()
        },
        threshold: args.threshold,
        compute_idwi: args.idwi.is_some(),
        compute_threshold_mask: args.threshold_mask.is_some(),
        ..DtiParams::default()
    })
}

/// Header and the dictionary it came from
fn load_header(args: &Args) -> Result<(DwiHeader, BTreeMap<String, String>)> {
    match (&args.header, &args.bvals, &args.bvecs) {
        (Some(path), _, _) => {
            let dict = read_dictionary(path)?;
            Ok((DwiHeader::from_dictionary(&dict)?, dict))
        }
        (None, Some(bvals), Some(bvecs)) => {
            let header = read_fsl(bvals, bvecs)?;
            let dict = header.to_dictionary();
            Ok((header, dict))
        }
        _ => Err(DtiError::config(
            "Gradient information missing: pass --header or --bvals with --bvecs",
        )),
    }
}

fn read_mask(path: &Path) -> Result<MaskVolume> {
    read_nifti_file(path)?.into_mask()
}

/// `tensors.nii.gz` -> `tensors.json`
fn sidecar_path(image: &Path) -> PathBuf {
    let name = image.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    image.with_file_name(format!("{}.json", stem))
}

fn run(args: Args) -> Result<()> {
    let params = params_from_args(&args)?;
    params.validate()?;
    let (header, dict) = load_header(&args)?;

    info!("Reading {}", args.dwi_image.display());
    let dwi = read_dwi_file(&args.dwi_image)?;
    info!(
        "Image {:?} with {} channels, b-value {}",
        dwi.grid.dims, dwi.n_channels, header.gradients.b_value()
    );

    let masks = Masks {
        inclusion: args.brain_mask.as_deref().map(read_mask).transpose()?,
        exclusion: args.bad_region_mask.as_deref().map(read_mask).transpose()?,
    };

    let grid = dwi.grid.clone();
    let output = run_dti(dwi, &header, &masks, &params)?;

    save_tensor_to_file(&args.tensor_output, &output.tensors)?;
    let sidecar = sidecar_path(&args.tensor_output);
    write_dictionary(&sidecar, &output_dictionary(&dict, &grid.image_frame()))?;
    info!("Wrote {} and {}", args.tensor_output.display(), sidecar.display());

    if let (Some(path), Some(idwi)) = (&args.idwi, &output.idwi) {
        save_nifti_to_file(path, idwi, &grid)?;
        info!("Wrote {}", path.display());
    }
    if let (Some(path), Some(mask)) = (&args.threshold_mask, &output.threshold_mask) {
        let values: Vec<f64> = mask.iter().map(|&m| m as f64).collect();
        save_nifti_to_file(path, &values, &grid)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}
