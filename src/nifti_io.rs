//! NIfTI file I/O
//!
//! Loads scalar (mask) and 4D diffusion-weighted volumes from byte arrays or
//! files, and writes scalar volumes and symmetric-matrix tensor volumes.
//! Gzip compression is detected on read and chosen by the `.nii.gz` suffix
//! on write.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{DtiError, Result};
use crate::tensor::TensorVolume;
use crate::volume::{DwiVolume, Grid, MaskVolume};

/// NIFTI_INTENT_SYMMATRIX: one symmetric matrix per voxel, stored along dim 5
pub const INTENT_SYMMATRIX: i16 = 1005;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const DT_FLOAT32: i16 = 16;

/// Scalar NIfTI volume loaded from bytes
pub struct NiftiData {
    /// Volume data as f64, Fortran order
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    /// Data scaling slope
    pub scl_slope: f64,
    /// Data scaling intercept
    pub scl_inter: f64,
}

impl NiftiData {
    pub fn grid(&self) -> Grid {
        Grid::new(self.dims, self.voxel_size, self.affine)
    }

    pub fn into_mask(self) -> Result<MaskVolume> {
        let grid = self.grid();
        MaskVolume::new(grid, self.data)
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < HEADER_SIZE {
        return format!("File too small ({} bytes, need at least {})", bytes.len(), HEADER_SIZE);
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn read_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let mut decoder = GzDecoder::new(Cursor::new(bytes));
            let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            DtiError::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| DtiError::Nifti(format!("Failed to read NIfTI: {} ({})", e, info)))
    }
}

/// Decode the volume and check it has at least three spatial dimensions
fn read_array(bytes: &[u8]) -> Result<(Array<f64, IxDyn>, (f64, f64, f64), [f64; 16], f64, f64)> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(DtiError::Nifti(format!("Expected at least 3D volume, got {}D", ndim)));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = get_affine(header);

    let array: Array<f64, IxDyn> = obj.into_volume()
        .into_ndarray()
        .map_err(|e| DtiError::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    if array.ndim() < 3 {
        return Err(DtiError::Nifti(format!("Expected at least 3D array, got {}D", array.ndim())));
    }
    Ok((array, voxel_size, affine, scl_slope, scl_inter))
}

/// Load a scalar NIfTI volume from bytes
///
/// 4D inputs contribute their first volume.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let (array, voxel_size, affine, scl_slope, scl_inter) = read_array(bytes)?;
    let shape = array.shape().to_vec();
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);

    // Fortran order (x fastest); trailing axes are pinned to their first index
    let mut index = vec![0usize; shape.len()];
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                index[0] = i;
                index[1] = j;
                index[2] = k;
                data.push(array[IxDyn(&index)]);
            }
        }
    }

    Ok(NiftiData {
        data,
        dims: (nx, ny, nz),
        voxel_size,
        affine,
        scl_slope,
        scl_inter,
    })
}

/// Load a 4D diffusion-weighted NIfTI volume from bytes
///
/// The fourth axis indexes the acquisitions; a 3D file is a single channel.
pub fn load_dwi(bytes: &[u8]) -> Result<DwiVolume> {
    let (array, voxel_size, affine, _, _) = read_array(bytes)?;
    let shape = array.shape().to_vec();
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };
    if shape.len() > 4 && shape[4..].iter().any(|&d| d > 1) {
        return Err(DtiError::Nifti(format!(
            "Expected a 4D diffusion volume, got shape {:?}", shape
        )));
    }

    // Volume-major (x fastest, then y, z, t) before interleaving channels
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    let mut index = vec![0usize; shape.len()];
    for t in 0..nt {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    index[0] = i;
                    index[1] = j;
                    index[2] = k;
                    if shape.len() >= 4 {
                        index[3] = t;
                    }
                    data.push(array[IxDyn(&index)]);
                }
            }
        }
    }

    DwiVolume::from_volume_major(&data, (nx, ny, nz, nt), voxel_size, affine)
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

fn to_dim(n: usize) -> Result<i16> {
    i16::try_from(n).map_err(|_| DtiError::Nifti(format!("Dimension {} exceeds NIfTI-1 limit", n)))
}

/// Serialize a float32 NIfTI-1 single file
///
/// `dim` is the full NIfTI dim array (dim[0] = number of dimensions).
fn encode_nifti(
    data: &[f64],
    dim: [i16; 8],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    intent_code: i16,
) -> Result<Vec<u8>> {
    let (vsx, vsy, vsz) = voxel_size;
    let mut header = [0u8; HEADER_SIZE];

    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());

    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    header[68..70].copy_from_slice(&intent_code.to_le_bytes());

    header[70..72].copy_from_slice(&DT_FLOAT32.to_le_bytes());

    // bitpix = 32
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset: header + 4 bytes extension
    header[108..112].copy_from_slice(&(VOX_OFFSET as f32).to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(VOX_OFFSET + data.len() * 4);
    buffer.write_all(&header)
        .map_err(|e| DtiError::Nifti(format!("Write header failed: {}", e)))?;
    // Extension flag: all zeros = no extension
    buffer.write_all(&[0u8; 4])
        .map_err(|e| DtiError::Nifti(format!("Write extension failed: {}", e)))?;
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())
            .map_err(|e| DtiError::Nifti(format!("Write data failed: {}", e)))?;
    }

    Ok(buffer)
}

/// Save a 3D scalar volume as NIfTI bytes
pub fn save_nifti(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    let (nx, ny, nz) = dims;
    if data.len() != nx * ny * nz {
        return Err(DtiError::Nifti(format!(
            "Data length {} does not match {}x{}x{}", data.len(), nx, ny, nz
        )));
    }
    let dim = [3, to_dim(nx)?, to_dim(ny)?, to_dim(nz)?, 1, 1, 1, 1];
    encode_nifti(data, dim, voxel_size, affine, 0)
}

/// Save a tensor volume as NIfTI bytes
///
/// Uses the symmetric-matrix intent: `dim = [5, nx, ny, nz, 1, 6]` with
/// components in lower-triangular order (xx, xy, yy, xz, yz, zz).
pub fn save_tensor_nifti(tensors: &TensorVolume) -> Result<Vec<u8>> {
    let grid = &tensors.grid;
    let (nx, ny, nz) = grid.dims;
    let dim = [5, to_dim(nx)?, to_dim(ny)?, to_dim(nz)?, 1, 6, 1, 1];
    let mut bytes = encode_nifti(
        &tensors.to_component_planes(),
        dim,
        grid.voxel_size,
        &grid.affine,
        INTENT_SYMMATRIX,
    )?;
    // intent_p1 = matrix dimension
    bytes[56..60].copy_from_slice(&3.0f32.to_le_bytes());
    Ok(bytes)
}

/// Gzip-compress encoded NIfTI bytes
fn gzip(uncompressed: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(uncompressed)
        .map_err(|e| DtiError::Nifti(format!("Gzip compression failed: {}", e)))?;
    encoder.finish()
        .map_err(|e| DtiError::Nifti(format!("Gzip finish failed: {}", e)))
}

fn write_bytes(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        gzip(&bytes)?
    } else {
        bytes
    };
    std::fs::write(path, &bytes).map_err(|e| DtiError::io(path, e))
}

/// Read a scalar NIfTI file (.nii or .nii.gz)
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    let bytes = std::fs::read(path).map_err(|e| DtiError::io(path, e))?;
    load_nifti(&bytes)
}

/// Read a 4D diffusion-weighted NIfTI file (.nii or .nii.gz)
pub fn read_dwi_file(path: &Path) -> Result<DwiVolume> {
    let bytes = std::fs::read(path).map_err(|e| DtiError::io(path, e))?;
    load_dwi(&bytes)
}

/// Save a scalar volume to a file, gzip compressed for `.nii.gz` paths
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    grid: &Grid,
) -> Result<()> {
    write_bytes(path, save_nifti(data, grid.dims, grid.voxel_size, &grid.affine)?)
}

/// Save a tensor volume to a file, gzip compressed for `.nii.gz` paths
pub fn save_tensor_to_file(path: &Path, tensors: &TensorVolume) -> Result<()> {
    write_bytes(path, save_tensor_nifti(tensors)?)
}
