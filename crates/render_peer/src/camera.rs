//! Camera state, the screen-ray generator, and the batch-mode orbit
//! animator.
//!
//! Matrices cross the wire as 16 f32 in row-major order (the control
//! protocol's convention); `glam` stores column-major, so conversion happens
//! here at the boundary and nowhere else.

use glam::{Mat4, Vec3, Vec4Swizzles};

/// Center of the unit volume every camera orbits.
pub const VOLUME_CENTER: Vec3 = Vec3::splat(0.5);

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub projection: Mat4,
    pub view: Mat4,
    /// `[x, y, width, height]` in pixels.
    pub viewport: [u32; 4],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            viewport: [0, 0, 1280, 720],
        }
    }
}

impl Camera {
    #[inline]
    pub fn width(&self) -> u32 {
        self.viewport[2]
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.viewport[3]
    }
}

/// Converts a row-major 16-float wire matrix into a `glam` matrix.
#[inline]
pub fn mat_from_row_major(m: &[f32; 16]) -> Mat4 {
    Mat4::from_cols_array(m).transpose()
}

/// Converts a `glam` matrix into the row-major wire layout.
#[inline]
pub fn mat_to_row_major(m: &Mat4) -> [f32; 16] {
    m.transpose().to_cols_array()
}

/// Per-frame ray generator: unprojects NDC through the inverse
/// view-projection so all peers derive identical rays from one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RayGenerator {
    inv_view_proj: Mat4,
}

impl RayGenerator {
    /// Fails on a singular or non-finite view-projection.
    pub fn new(camera: &Camera) -> Option<Self> {
        let view_proj = camera.projection * camera.view;
        let det = view_proj.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        Some(Self {
            inv_view_proj: view_proj.inverse(),
        })
    }

    #[inline]
    fn unproject(&self, u: f32, v: f32, ndc_z: f32) -> Option<Vec3> {
        let p = self.inv_view_proj * glam::Vec4::new(u, v, ndc_z, 1.0);
        if p.w.abs() < f32::EPSILON {
            return None;
        }
        Some(p.xyz() / p.w)
    }

    /// World-space origin and unit direction for an NDC screen point.
    pub fn ray(&self, u: f32, v: f32) -> Option<(Vec3, Vec3)> {
        let near = self.unproject(u, v, 0.0)?;
        let far = self.unproject(u, v, 1.0)?;
        let dir = (far - near).try_normalize()?;
        Some((near, dir))
    }
}

/// Batch-mode animator: one full orbit around the volume over `t` in
/// `[0,1)`, slightly elevated, always looking at the volume center.
pub fn orbit_camera(t: f32, width: u32, height: u32) -> Camera {
    let angle = t * std::f32::consts::TAU;
    let eye = VOLUME_CENTER + Vec3::new(2.5 * angle.cos(), 1.2, 2.5 * angle.sin());
    let aspect = width as f32 / height.max(1) as f32;
    Camera {
        projection: Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0),
        view: Mat4::look_at_rh(eye, VOLUME_CENTER, Vec3::Y),
        viewport: [0, 0, width, height],
    }
}
