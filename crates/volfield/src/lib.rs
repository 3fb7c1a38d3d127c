//! Scalar volume fields for the distributed renderer.
//!
//! A [`VolumeField`] is a dense 3D grid of f32 samples with row-major
//! (x-fastest) layout:
//!
//!   `data[x + y * dims[0] + z * dims[0] * dims[1]]`
//!
//! Fields are immutable once built and are replaced wholesale when the time
//! step changes. Sampling addresses the field through normalized texture
//! coordinates in `[0,1]^3`, with trilinear filtering between voxel centers.
//!
//! The crate also carries the dataset loader ([`loader`]) and the
//! bioelectric tissue model ([`bio`]) that synthesizes a field when no
//! dataset is on disk.

pub mod bio;
pub mod loader;

pub use bio::BioelectricState;
pub use loader::{DataLoader, LoadError};

/// A dense scalar field over a regular 3D grid.
#[derive(Debug, Clone)]
pub struct VolumeField {
    dims: [u32; 3],
    spacing: [f32; 3],
    origin: [f32; 3],
    data: Vec<f32>,
}

impl VolumeField {
    /// Builds a field from raw samples, validating the grid geometry.
    pub fn new(
        dims: [u32; 3],
        spacing: [f32; 3],
        origin: [f32; 3],
        data: Vec<f32>,
    ) -> Result<Self, LoadError> {
        if dims.iter().any(|&d| d == 0) {
            return Err(LoadError::Geometry(format!(
                "volume dimensions must be >= 1, got {dims:?}"
            )));
        }
        if spacing.iter().any(|&s| s <= 0.0) {
            return Err(LoadError::Geometry(format!(
                "voxel spacing must be > 0, got {spacing:?}"
            )));
        }
        let expected = dims.iter().map(|&d| d as usize).product::<usize>();
        if data.len() != expected {
            return Err(LoadError::Geometry(format!(
                "sample count {} does not match {}x{}x{} grid ({expected})",
                data.len(),
                dims[0],
                dims[1],
                dims[2]
            )));
        }
        Ok(Self {
            dims,
            spacing,
            origin,
            data,
        })
    }

    /// Procedural fallback dataset: a soft sphere centered in the grid,
    /// 1.0 at the center falling off linearly to 0 at a third of the size.
    pub fn procedural_sphere(size: u32) -> Self {
        let n = size as usize;
        let center = size as f32 / 2.0;
        let radius = size as f32 / 3.0;
        let mut data = vec![0.0f32; n * n * n];
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let dx = x as f32 - center;
                    let dy = y as f32 - center;
                    let dz = z as f32 - center;
                    let dist = (dx * dx + dy * dy + dz * dz).sqrt();
                    data[x + y * n + z * n * n] = (1.0 - dist / radius).max(0.0);
                }
            }
        }
        Self {
            dims: [size; 3],
            spacing: [1.0; 3],
            origin: [0.0; 3],
            data,
        }
    }

    #[inline]
    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    #[inline]
    pub fn spacing(&self) -> [f32; 3] {
        self.spacing
    }

    #[inline]
    pub fn origin(&self) -> [f32; 3] {
        self.origin
    }

    #[inline]
    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at an integer voxel coordinate. Coordinates must be in range.
    #[inline]
    pub fn voxel(&self, x: u32, y: u32, z: u32) -> f32 {
        let idx = x as usize
            + y as usize * self.dims[0] as usize
            + z as usize * self.dims[0] as usize * self.dims[1] as usize;
        self.data[idx]
    }

    /// Trilinear sample at normalized coordinates.
    ///
    /// `pos` components are expected in `[0,1]`; callers cull against the
    /// unit cube before sampling. Out-of-range inputs are clamped to the
    /// grid, so the field extends its boundary values rather than wrapping.
    pub fn sample(&self, pos: [f32; 3]) -> f32 {
        let [dx, dy, dz] = self.dims;

        let x = pos[0].clamp(0.0, 1.0) * (dx - 1) as f32;
        let y = pos[1].clamp(0.0, 1.0) * (dy - 1) as f32;
        let z = pos[2].clamp(0.0, 1.0) * (dz - 1) as f32;

        let x0 = x as u32;
        let y0 = y as u32;
        let z0 = z as u32;
        let x1 = (x0 + 1).min(dx - 1);
        let y1 = (y0 + 1).min(dy - 1);
        let z1 = (z0 + 1).min(dz - 1);

        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let fz = z - z0 as f32;

        // Eight corners, then lerp along x, y, z in turn.
        let v000 = self.voxel(x0, y0, z0);
        let v100 = self.voxel(x1, y0, z0);
        let v010 = self.voxel(x0, y1, z0);
        let v110 = self.voxel(x1, y1, z0);
        let v001 = self.voxel(x0, y0, z1);
        let v101 = self.voxel(x1, y0, z1);
        let v011 = self.voxel(x0, y1, z1);
        let v111 = self.voxel(x1, y1, z1);

        let v00 = v000 * (1.0 - fx) + v100 * fx;
        let v01 = v001 * (1.0 - fx) + v101 * fx;
        let v10 = v010 * (1.0 - fx) + v110 * fx;
        let v11 = v011 * (1.0 - fx) + v111 * fx;

        let v0 = v00 * (1.0 - fy) + v10 * fy;
        let v1 = v01 * (1.0 - fy) + v11 * fy;

        v0 * (1.0 - fz) + v1 * fz
    }
}
