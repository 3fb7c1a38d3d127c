//! Per-brick volume ray marching.
//!
//! Every peer runs this over its assigned bricks. Rays are generated from
//! the shared camera snapshot, so all peers march identical rays; a brick
//! only bounds the parameter interval a peer samples. Accumulation is
//! front-to-back in premultiplied space with early termination once the
//! pixel is effectively opaque.

use glam::{Vec3, Vec4};
use thiserror::Error;

use volfield::{BioelectricState, VolumeField};

use crate::camera::{Camera, RayGenerator};
use crate::frame::{over_premultiplied, Frame};
use crate::transfer::TransferFunction;

/// March horizon along the ray parameter.
pub const T_MAX: f32 = 5.0;
/// Accumulated alpha above which a ray stops early.
const ALPHA_CUTOFF: f32 = 0.95;
/// Samples below this field value contribute nothing.
const VALUE_FLOOR: f32 = 0.05;
/// Accumulated alpha below which a pixel is left untouched.
const WRITE_FLOOR: f32 = 0.01;
/// Central-difference half step for gradients.
const GRADIENT_H: f32 = 0.01;
const GRADIENT_FLOOR: f32 = 0.01;
const LIGHT_DIR: Vec3 = Vec3::new(0.5, 0.5, 0.5);

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid viewport {width}x{height} (frame is {frame_width}x{frame_height})")]
    InvalidViewport {
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("singular view-projection matrix")]
    SingularCamera,
    #[error("step size {0} outside (0, sqrt(3)]")]
    BadStepSize(f32),
    #[error("max steps must be >= 1")]
    BadMaxSteps,
}

/// Quality-derived marching parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    pub quality: u8,
    pub step_size: f32,
    pub max_steps: u32,
    pub enable_gradients: bool,
    pub enable_shadows: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            quality: 1,
            step_size: 0.01,
            max_steps: 1000,
            enable_gradients: true,
            enable_shadows: false,
        }
    }
}

impl RenderParams {
    /// Maps the control protocol's quality tier onto marching parameters.
    /// High quality additionally bumps the internal tier, which downstream
    /// stages may use for supersampling decisions.
    pub fn from_quality_tier(tier: u8) -> Self {
        let (quality, step_size) = match tier {
            0 => (0, 0.02),
            2 => (3, 0.005),
            _ => (1, 0.01),
        };
        Self {
            quality,
            step_size,
            ..Self::default()
        }
    }
}

/// An axis-aligned sub-region of the unit volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrickInfo {
    pub id: u32,
    pub min_bounds: Vec3,
    pub max_bounds: Vec3,
    pub lod_level: u32,
    pub priority: f32,
}

impl BrickInfo {
    /// Half-open membership so neighboring bricks never both own a sample;
    /// outer faces of the unit cube stay inclusive.
    #[inline]
    fn contains(&self, p: Vec3) -> bool {
        for axis in 0..3 {
            let lo = self.min_bounds[axis];
            let hi = self.max_bounds[axis];
            if p[axis] < lo || p[axis] > hi {
                return false;
            }
            if p[axis] >= hi && hi < 1.0 {
                return false;
            }
        }
        true
    }

    /// Ray-parameter interval where the ray overlaps this brick, clipped to
    /// `[0, T_MAX]`.
    fn march_interval(&self, origin: Vec3, dir: Vec3) -> Option<(f32, f32)> {
        let mut t0: f32 = 0.0;
        let mut t1: f32 = T_MAX;
        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            if d.abs() < 1e-9 {
                if o < self.min_bounds[axis] || o > self.max_bounds[axis] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut near = (self.min_bounds[axis] - o) * inv;
            let mut far = (self.max_bounds[axis] - o) * inv;
            if near > far {
                std::mem::swap(&mut near, &mut far);
            }
            t0 = t0.max(near);
            t1 = t1.min(far);
            if t0 > t1 {
                return None;
            }
        }
        Some((t0, t1))
    }
}

/// Converts camera, transfer function and volume state into frame pixels.
pub struct VolumeRaymarcher {
    volume: Option<VolumeField>,
    volume_generated: bool,
    camera: Camera,
    transfer: TransferFunction,
    params: RenderParams,
    bio: BioelectricState,
}

impl Default for VolumeRaymarcher {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeRaymarcher {
    pub fn new() -> Self {
        Self {
            volume: None,
            volume_generated: false,
            camera: Camera::default(),
            transfer: TransferFunction::default(),
            params: RenderParams::default(),
            bio: BioelectricState::default(),
        }
    }

    /// Installs a loaded dataset, displacing any generated tissue volume.
    pub fn set_volume(&mut self, volume: VolumeField) {
        self.volume = Some(volume);
        self.volume_generated = false;
    }

    /// Drops the current volume so the next render regenerates tissue.
    pub fn clear_volume(&mut self) {
        self.volume = None;
        self.volume_generated = false;
    }

    pub fn set_camera(&mut self, camera: Camera) -> Result<(), RenderError> {
        if camera.width() == 0 || camera.height() == 0 {
            return Err(RenderError::InvalidViewport {
                width: camera.width(),
                height: camera.height(),
                frame_width: 0,
                frame_height: 0,
            });
        }
        self.camera = camera;
        Ok(())
    }

    pub fn set_transfer(&mut self, transfer: TransferFunction) {
        self.transfer = transfer;
    }

    pub fn set_params(&mut self, params: RenderParams) -> Result<(), RenderError> {
        // The march lives in the unit cube, so a useful step never exceeds
        // its diagonal.
        if !(params.step_size > 0.0 && params.step_size <= 3f32.sqrt()) {
            return Err(RenderError::BadStepSize(params.step_size));
        }
        if params.max_steps == 0 {
            return Err(RenderError::BadMaxSteps);
        }
        self.params = params;
        Ok(())
    }

    /// Updates the tissue parameters; a generated volume is invalidated and
    /// rebuilt lazily on the next render.
    pub fn set_bio_params(&mut self, state: BioelectricState) {
        if self.bio != state {
            self.bio = state;
            if self.volume_generated {
                self.volume = None;
            }
        }
    }

    /// Marches `brick` and accumulates into `frame` without clearing it.
    ///
    /// A pixel still holding the clear value is replaced outright; a pixel
    /// already carrying another brick's contribution is merged near-over-far
    /// in premultiplied space, which is exact for the disjoint depth
    /// intervals bricks produce.
    pub fn render_brick(&mut self, brick: &BrickInfo, frame: &mut Frame) -> Result<(), RenderError> {
        let width = self.camera.width();
        let height = self.camera.height();
        if width == 0 || height == 0 || width != frame.width() || height != frame.height() {
            return Err(RenderError::InvalidViewport {
                width,
                height,
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }

        if self.volume.is_none() {
            tracing::info!(brick = brick.id, "no volume loaded, generating tissue field");
            self.volume = Some(self.bio.generate_volume());
            self.volume_generated = true;
        }
        let volume = self.volume.as_ref().unwrap_or_else(|| unreachable!());

        let rays = RayGenerator::new(&self.camera).ok_or(RenderError::SingularCamera)?;
        let step = self.params.step_size;

        for py in 0..height {
            let v = 1.0 - 2.0 * py as f32 / height as f32;
            for px in 0..width {
                let u = 2.0 * px as f32 / width as f32 - 1.0;
                let Some((origin, dir)) = rays.ray(u, v) else {
                    continue;
                };
                let Some((t_enter, t_exit)) = brick.march_interval(origin, dir) else {
                    continue;
                };

                let mut accum = Vec4::ZERO;
                let mut first_hit: Option<f32> = None;
                let mut steps = 0u32;

                // Keep the global step phase (t = k * step) so the union of
                // brick marches equals one full march of the volume.
                let mut k = (t_enter / step).ceil().max(0.0) as u64;
                loop {
                    let t = k as f32 * step;
                    if t > t_exit || t >= T_MAX || steps >= self.params.max_steps {
                        break;
                    }
                    k += 1;

                    let pos = origin + dir * t;
                    if !brick.contains(pos) {
                        continue;
                    }
                    steps += 1;

                    let value = volume.sample(pos.into());
                    if value < VALUE_FLOOR {
                        continue;
                    }
                    if first_hit.is_none() {
                        first_hit = Some(t);
                    }

                    let mut color = self.transfer.evaluate(value);
                    if self.params.enable_gradients {
                        shade(volume, pos, &mut color);
                    }

                    // Opacity correction for the step length.
                    let alpha = (color.w * step * 3.0).min(1.0);
                    let weight = alpha * (1.0 - accum.w);
                    accum.x += color.x * weight;
                    accum.y += color.y * weight;
                    accum.z += color.z * weight;
                    accum.w += weight;

                    if accum.w > ALPHA_CUTOFF {
                        break;
                    }
                }

                if accum.w > WRITE_FLOOR {
                    let index = (py * width + px) as usize;
                    let depth = (first_hit.unwrap_or(t_exit) / T_MAX).clamp(0.0, 1.0);
                    if frame.depth[index] >= 1.0 {
                        frame.set_pixel(index, accum, depth);
                    } else {
                        merge_contribution(frame, index, accum, depth);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Lambert shading against the fixed light using the central-difference
/// gradient as the surface normal.
fn shade(volume: &VolumeField, pos: Vec3, color: &mut Vec4) {
    let g = Vec3::new(
        volume.sample([pos.x + GRADIENT_H, pos.y, pos.z])
            - volume.sample([pos.x - GRADIENT_H, pos.y, pos.z]),
        volume.sample([pos.x, pos.y + GRADIENT_H, pos.z])
            - volume.sample([pos.x, pos.y - GRADIENT_H, pos.z]),
        volume.sample([pos.x, pos.y, pos.z + GRADIENT_H])
            - volume.sample([pos.x, pos.y, pos.z - GRADIENT_H]),
    ) / (2.0 * GRADIENT_H);

    let mag = g.length();
    if mag > GRADIENT_FLOOR {
        let lambert = (-g.dot(LIGHT_DIR) / mag).max(0.0);
        let lit = 0.3 + 0.7 * lambert;
        color.x *= lit;
        color.y *= lit;
        color.z *= lit;
    }
}

/// Depth-orders a new brick contribution against the pixel's current value
/// and composites premultiplied near over far.
fn merge_contribution(frame: &mut Frame, index: usize, rgba: Vec4, depth: f32) {
    let held = frame.pixel(index);
    let held_depth = frame.depth[index];
    let (near, far, out_depth) = if depth < held_depth {
        (rgba, held, depth)
    } else {
        (held, rgba, held_depth)
    };
    frame.set_pixel(index, over_premultiplied(near, far), out_depth);
}
