//! Per-frame orchestration: apply the broadcast snapshot, march the
//! assigned bricks, composite across the group.

use glam::Vec3;

use volfield::{BioelectricState, DataLoader};

use crate::camera::{mat_from_row_major, Camera};
use crate::comm::PeerGroup;
use crate::compositor::{CompositeError, CompositeParams, Compositor};
use crate::control::ControlState;
use crate::frame::Frame;
use crate::raymarch::{BrickInfo, RenderError, RenderParams, VolumeRaymarcher};

/// Fixed brick set: a 2x2x2 grid tiling the unit volume.
pub const TOTAL_BRICKS: u32 = 8;

/// Contiguous block partition of the brick set. Lower ranks absorb the
/// leftovers; ranks past the brick count get none and contribute an
/// all-background frame to compositing.
pub fn assign_bricks(rank: usize, size: usize) -> Vec<BrickInfo> {
    let per = (TOTAL_BRICKS as usize).div_ceil(size);
    let start = rank * per;
    let end = ((rank + 1) * per).min(TOTAL_BRICKS as usize);
    (start..end).map(|id| brick_from_id(id as u32)).collect()
}

fn brick_from_id(id: u32) -> BrickInfo {
    let bx = (id % 2) as f32;
    let by = ((id / 2) % 2) as f32;
    let bz = (id / 4) as f32;
    let min_bounds = Vec3::new(bx, by, bz) * 0.5;
    BrickInfo {
        id,
        min_bounds,
        max_bounds: min_bounds + Vec3::splat(0.5),
        lod_level: 0,
        priority: 1.0,
    }
}

/// One peer's rendering state across frames.
pub struct Renderer {
    rank: usize,
    marcher: VolumeRaymarcher,
    compositor: Compositor,
    local: Frame,
    output: Frame,
    bricks: Vec<BrickInfo>,
    composite: CompositeParams,
    loader: Option<DataLoader>,
    dataset: String,
    loaded_step: Option<i32>,
    bio_raw: Option<String>,
}

impl Renderer {
    pub fn new(
        rank: usize,
        size: usize,
        width: u32,
        height: u32,
        composite: CompositeParams,
        loader: Option<DataLoader>,
        dataset: String,
    ) -> Self {
        // Non-root peers never read the composited output, so they hold a
        // placeholder instead of a second full-size frame.
        let output = if rank == 0 {
            Frame::new(width, height)
        } else {
            Frame::new(1, 1)
        };
        Self {
            rank,
            marcher: VolumeRaymarcher::new(),
            compositor: Compositor::new(),
            local: Frame::new(width, height),
            output,
            bricks: assign_bricks(rank, size),
            composite,
            loader,
            dataset,
            loaded_step: None,
            bio_raw: None,
        }
    }

    #[inline]
    pub fn output(&self) -> &Frame {
        &self.output
    }

    #[inline]
    pub fn local(&self) -> &Frame {
        &self.local
    }

    #[inline]
    pub fn bricks(&self) -> &[BrickInfo] {
        &self.bricks
    }

    pub fn marcher_mut(&mut self) -> &mut VolumeRaymarcher {
        &mut self.marcher
    }

    /// Applies one broadcast snapshot: camera, quality, bioelectric
    /// parameters and, when the time step moved, the volume itself.
    pub fn apply_snapshot(&mut self, snapshot: &ControlState) -> Result<(), RenderError> {
        let [vw, vh] = snapshot.viewport;
        if vw != self.local.width() || vh != self.local.height() {
            return Err(RenderError::InvalidViewport {
                width: vw,
                height: vh,
                frame_width: self.local.width(),
                frame_height: self.local.height(),
            });
        }

        self.marcher.set_camera(Camera {
            projection: mat_from_row_major(&snapshot.projection),
            view: mat_from_row_major(&snapshot.view),
            viewport: [0, 0, vw, vh],
        })?;
        self.marcher
            .set_params(RenderParams::from_quality_tier(snapshot.quality))?;

        if snapshot.bio_params != self.bio_raw {
            if let Some(text) = &snapshot.bio_params {
                match BioelectricState::from_json(text) {
                    Ok(state) => self.marcher.set_bio_params(state),
                    Err(error) => {
                        tracing::warn!(%error, "ignoring malformed bioelectric params")
                    }
                }
            }
            self.bio_raw = snapshot.bio_params.clone();
        }

        if let Some(loader) = &self.loader {
            if self.loaded_step != Some(snapshot.time_step) {
                match loader.load_volume(&self.dataset, snapshot.time_step) {
                    Ok(volume) => self.marcher.set_volume(volume),
                    Err(error) => {
                        tracing::warn!(
                            %error,
                            time_step = snapshot.time_step,
                            "volume load failed, falling back to generated tissue"
                        );
                        self.marcher.clear_volume();
                    }
                }
                self.loaded_step = Some(snapshot.time_step);
            }
        }

        Ok(())
    }

    /// Renders the assigned bricks and composites across the group.
    ///
    /// Returns whether the local render succeeded; on failure this peer
    /// still contributes its background frame so the collective exchange
    /// stays in lockstep, and rank 0 skips the encode.
    pub fn render_frame(&mut self, group: &mut PeerGroup) -> Result<bool, CompositeError> {
        self.local.clear();

        let mut rendered = true;
        // Split borrows: the marcher mutates lazily (tissue generation)
        // while writing into the local frame.
        let marcher = &mut self.marcher;
        for brick in &self.bricks {
            if let Err(error) = marcher.render_brick(brick, &mut self.local) {
                tracing::error!(%error, brick = brick.id, rank = self.rank, "brick render failed");
                rendered = false;
                break;
            }
        }

        self.compositor
            .composite(group, &self.local, &mut self.output, &self.composite)?;
        Ok(rendered)
    }
}
