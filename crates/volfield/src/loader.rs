//! Dataset resolution and loading.
//!
//! Datasets live under `<base>/<dataset>/t_<step>/`. A time step directory
//! holds either a raw 128^3 f32 blob (`volume.raw`) or chunked-store
//! metadata (`.zarray`); when neither is present the loader degrades to the
//! procedural sphere so rendering can continue.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::VolumeField;

/// Edge length of raw volume blobs.
const RAW_DIM: u32 = 128;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid volume geometry: {0}")]
    Geometry(String),
    #[error("bad store metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("unsupported dtype {0:?} (only little-endian f32 is handled)")]
    UnsupportedDtype(String),
    #[error("{path}: expected {expected} bytes, got {got}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
}

/// Resolves and loads volume data for a dataset/time-step pair.
#[derive(Debug, Clone)]
pub struct DataLoader {
    base_path: PathBuf,
}

impl DataLoader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Loads `<base>/<dataset>/t_<step>`, falling back to the procedural
    /// sphere when the directory holds no recognized data.
    pub fn load_volume(&self, dataset: &str, time_step: i32) -> Result<VolumeField, LoadError> {
        let dir = self.base_path.join(dataset).join(format!("t_{time_step}"));

        let raw = dir.join("volume.raw");
        if raw.exists() {
            tracing::info!(path = %raw.display(), "loading raw volume");
            return load_raw(&raw, [RAW_DIM; 3]);
        }

        let zarray = dir.join(".zarray");
        if zarray.exists() {
            tracing::info!(path = %dir.display(), "loading chunked store");
            return load_zarr(&dir);
        }

        tracing::warn!(
            dataset,
            time_step,
            path = %dir.display(),
            "dataset not found, generating procedural volume"
        );
        Ok(VolumeField::procedural_sphere(64))
    }
}

/// Reads a dense little-endian f32 blob of the given dimensions.
pub fn load_raw(path: &Path, dims: [u32; 3]) -> Result<VolumeField, LoadError> {
    let bytes = fs::read(path)?;
    let expected = dims.iter().map(|&d| d as usize).product::<usize>() * 4;
    if bytes.len() != expected {
        return Err(LoadError::Truncated {
            path: path.to_path_buf(),
            expected,
            got: bytes.len(),
        });
    }
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    VolumeField::new(dims, [1.0; 3], [0.0; 3], data)
}

// Zarr v2 array metadata, reduced to the keys the renderer consumes.
// Shapes follow the store's C-order convention: slowest dimension first,
// so `shape == [z, y, x]`.
#[derive(Debug, Deserialize)]
struct ZarrMeta {
    shape: Vec<u32>,
    chunks: Vec<u32>,
    dtype: String,
}

fn load_zarr(dir: &Path) -> Result<VolumeField, LoadError> {
    let meta: ZarrMeta = serde_json::from_str(&fs::read_to_string(dir.join(".zarray"))?)?;

    if meta.shape.len() != 3 || meta.chunks.len() != 3 {
        return Err(LoadError::Geometry(format!(
            "expected a 3D store, got shape {:?} chunks {:?}",
            meta.shape, meta.chunks
        )));
    }
    if meta.dtype != "<f4" {
        return Err(LoadError::UnsupportedDtype(meta.dtype));
    }
    if meta.shape.iter().any(|&d| d == 0) || meta.chunks.iter().any(|&d| d == 0) {
        return Err(LoadError::Geometry("zero-sized store dimension".into()));
    }

    // Store order is [z, y, x]; the field is x-fastest.
    let dims = [meta.shape[2], meta.shape[1], meta.shape[0]];
    let voxel_count = dims.iter().map(|&d| d as usize).product::<usize>();

    // A store with no materialized chunks is legal during ingestion; fill it
    // with a recognizable ramp so downstream stages still have data.
    if !dir.join("0.0.0").exists() {
        tracing::warn!(path = %dir.display(), "store has no chunk files, synthesizing ramp");
        let data = (0..voxel_count)
            .map(|i| i as f32 / voxel_count as f32)
            .collect();
        return VolumeField::new(dims, [1.0; 3], [0.0; 3], data);
    }

    let [cz, cy, cx] = [meta.chunks[0], meta.chunks[1], meta.chunks[2]];
    let grid = [
        meta.shape[0].div_ceil(cz),
        meta.shape[1].div_ceil(cy),
        meta.shape[2].div_ceil(cx),
    ];

    let mut data = vec![0.0f32; voxel_count];
    for gz in 0..grid[0] {
        for gy in 0..grid[1] {
            for gx in 0..grid[2] {
                let chunk_path = dir.join(format!("{gz}.{gy}.{gx}"));
                let bytes = fs::read(&chunk_path)?;
                let expected = (cz * cy * cx) as usize * 4;
                if bytes.len() != expected {
                    return Err(LoadError::Truncated {
                        path: chunk_path,
                        expected,
                        got: bytes.len(),
                    });
                }
                copy_chunk(&mut data, dims, &bytes, [cz, cy, cx], [gz, gy, gx]);
            }
        }
    }

    VolumeField::new(dims, [1.0; 3], [0.0; 3], data)
}

/// Copies one C-order chunk into the x-fastest field buffer, dropping the
/// padding of edge chunks.
fn copy_chunk(
    data: &mut [f32],
    dims: [u32; 3],
    bytes: &[u8],
    chunk: [u32; 3],
    grid_pos: [u32; 3],
) {
    let [dx, dy, dz] = dims;
    let [cz, cy, cx] = chunk;
    for lz in 0..cz {
        let z = grid_pos[0] * cz + lz;
        if z >= dz {
            break;
        }
        for ly in 0..cy {
            let y = grid_pos[1] * cy + ly;
            if y >= dy {
                break;
            }
            for lx in 0..cx {
                let x = grid_pos[2] * cx + lx;
                if x >= dx {
                    break;
                }
                let src = ((lz * cy + ly) * cx + lx) as usize * 4;
                let value =
                    f32::from_le_bytes([bytes[src], bytes[src + 1], bytes[src + 2], bytes[src + 3]]);
                data[(x + y * dx + z * dx * dy) as usize] = value;
            }
        }
    }
}
