//! Image-space compositing across the peer group.
//!
//! Every peer renders a full-resolution frame covering only its bricks;
//! this module merges those frames into one output held by rank 0. Small
//! groups use direct-send (everyone ships both planes to the root); larger
//! groups run binary swap so per-link traffic shrinks with the group size.
//!
//! Merge operators treat the lower rank as the stable "A" side, so results
//! are identical to folding frames in ascending rank order regardless of
//! the exchange pattern that delivered them.

use glam::Vec4;
use thiserror::Error;

use crate::comm::{CommError, PeerGroup, TAG_COLOR, TAG_DEPTH};
use crate::frame::{encode_channel, over_premultiplied, Frame, CHANNELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Winner-takes-all on depth.
    MinDepth,
    /// Depth-ordered premultiplied `over`.
    AlphaBlend,
    /// Per-channel maximum; mostly a diagnostic view.
    MaxIntensity,
}

#[derive(Debug, Clone, Copy)]
pub struct CompositeParams {
    pub mode: CompositeMode,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            mode: CompositeMode::MinDepth,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("frame geometry mismatch: local {local}, output {output}")]
    Mismatch { local: String, output: String },
    #[error("peer {peer} contributed {got} color bytes, expected {expected}")]
    BadContribution {
        peer: usize,
        got: usize,
        expected: usize,
    },
    #[error(transparent)]
    Comm(#[from] CommError),
}

/// Group size at or below which direct-send wins over binary swap.
const DIRECT_SEND_LIMIT: usize = 8;

/// Compositor with reusable receive scratch.
#[derive(Default)]
pub struct Compositor {
    work_color: Vec<u8>,
    work_depth: Vec<f32>,
}

impl Compositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the group's local frames into `output` on rank 0. On other
    /// ranks `output` is a placeholder and is left untouched.
    pub fn composite(
        &mut self,
        group: &mut PeerGroup,
        local: &Frame,
        output: &mut Frame,
        params: &CompositeParams,
    ) -> Result<(), CompositeError> {
        if group.rank() == 0 && !local.matches(output) {
            return Err(CompositeError::Mismatch {
                local: format!("{}x{}", local.width(), local.height()),
                output: format!("{}x{}", output.width(), output.height()),
            });
        }

        if group.size() == 1 {
            output.copy_from(local);
            return Ok(());
        }

        if group.size() <= DIRECT_SEND_LIMIT {
            self.direct_send(group, local, output, params)
        } else {
            self.binary_swap(group, local, output, params)
        }
    }

    /// All non-root peers ship both planes to rank 0, which folds arrivals
    /// in ascending rank order starting from its own frame.
    fn direct_send(
        &mut self,
        group: &mut PeerGroup,
        local: &Frame,
        output: &mut Frame,
        params: &CompositeParams,
    ) -> Result<(), CompositeError> {
        if group.rank() != 0 {
            group.send(0, TAG_COLOR, &local.color)?;
            group.send(0, TAG_DEPTH, bytemuck::cast_slice(&local.depth))?;
            return Ok(());
        }

        output.copy_from(local);
        for peer in 1..group.size() {
            let color = group.recv(peer, TAG_COLOR)?;
            let depth_bytes = group.recv(peer, TAG_DEPTH)?;
            if color.len() != output.color.len() {
                return Err(CompositeError::BadContribution {
                    peer,
                    got: color.len(),
                    expected: output.color.len(),
                });
            }
            let depth = depth_plane(peer, &depth_bytes, output.depth.len())?;
            merge_span(
                &mut output.color,
                &mut output.depth,
                &color,
                &depth,
                params.mode,
                false,
            );
        }
        Ok(())
    }

    /// Binary swap over the largest power-of-two subgroup; remainder peers
    /// pre-fold their frame onto a partner, and rank 0 gathers the finished
    /// tiles.
    fn binary_swap(
        &mut self,
        group: &mut PeerGroup,
        local: &Frame,
        output: &mut Frame,
        params: &CompositeParams,
    ) -> Result<(), CompositeError> {
        let size = group.size();
        let rank = group.rank();
        let pixels = local.pixel_count();
        let m = 1usize << size.ilog2();
        let rounds = m.trailing_zeros();

        if rank >= m {
            // Fold onto the power-of-two subgroup and sit out the rounds.
            group.send(rank - m, TAG_COLOR, &local.color)?;
            group.send(rank - m, TAG_DEPTH, bytemuck::cast_slice(&local.depth))?;
            return Ok(());
        }

        self.work_color.clear();
        self.work_color.extend_from_slice(&local.color);
        self.work_depth.clear();
        self.work_depth.extend_from_slice(&local.depth);

        if rank + m < size {
            let color = group.recv(rank + m, TAG_COLOR)?;
            let depth_bytes = group.recv(rank + m, TAG_DEPTH)?;
            if color.len() != self.work_color.len() {
                return Err(CompositeError::BadContribution {
                    peer: rank + m,
                    got: color.len(),
                    expected: self.work_color.len(),
                });
            }
            let depth = depth_plane(rank + m, &depth_bytes, self.work_depth.len())?;
            merge_span(
                &mut self.work_color,
                &mut self.work_depth,
                &color,
                &depth,
                params.mode,
                false,
            );
        }

        // Halving rounds: each round splits the held span with the partner
        // across bit k and keeps the half matching this rank's bit.
        let (mut lo, mut hi) = (0usize, pixels);
        for k in 0..rounds {
            let bit = 1usize << k;
            let partner = rank ^ bit;
            let mid = lo + (hi - lo) / 2;
            let (keep, give) = if rank & bit == 0 {
                ((lo, mid), (mid, hi))
            } else {
                ((mid, hi), (lo, mid))
            };

            // The lower rank of each pair transmits first so the pairwise
            // exchange never deadlocks on full socket buffers.
            let give_color = self.work_color[give.0 * CHANNELS..give.1 * CHANNELS].to_vec();
            let give_depth: &[f32] = &self.work_depth[give.0..give.1];
            let give_depth = bytemuck::cast_slice::<f32, u8>(give_depth).to_vec();
            let (their_color, their_depth_bytes) = if rank < partner {
                group.send(partner, TAG_COLOR, &give_color)?;
                group.send(partner, TAG_DEPTH, &give_depth)?;
                let c = group.recv(partner, TAG_COLOR)?;
                let d = group.recv(partner, TAG_DEPTH)?;
                (c, d)
            } else {
                let c = group.recv(partner, TAG_COLOR)?;
                let d = group.recv(partner, TAG_DEPTH)?;
                group.send(partner, TAG_COLOR, &give_color)?;
                group.send(partner, TAG_DEPTH, &give_depth)?;
                (c, d)
            };

            let span_pixels = keep.1 - keep.0;
            if their_color.len() != span_pixels * CHANNELS {
                return Err(CompositeError::BadContribution {
                    peer: partner,
                    got: their_color.len(),
                    expected: span_pixels * CHANNELS,
                });
            }
            let their_depth = depth_plane(partner, &their_depth_bytes, span_pixels)?;
            merge_span(
                &mut self.work_color[keep.0 * CHANNELS..keep.1 * CHANNELS],
                &mut self.work_depth[keep.0..keep.1],
                &their_color,
                &their_depth,
                params.mode,
                partner < rank,
            );

            (lo, hi) = keep;
        }

        // Gather the finished tiles on rank 0.
        if rank == 0 {
            output.color[lo * CHANNELS..hi * CHANNELS]
                .copy_from_slice(&self.work_color[lo * CHANNELS..hi * CHANNELS]);
            output.depth[lo..hi].copy_from_slice(&self.work_depth[lo..hi]);
            for peer in 1..m {
                let (span_lo, span_hi) = final_span(peer, rounds, pixels);
                let color = group.recv(peer, TAG_COLOR)?;
                let depth_bytes = group.recv(peer, TAG_DEPTH)?;
                if color.len() != (span_hi - span_lo) * CHANNELS {
                    return Err(CompositeError::BadContribution {
                        peer,
                        got: color.len(),
                        expected: (span_hi - span_lo) * CHANNELS,
                    });
                }
                output.color[span_lo * CHANNELS..span_hi * CHANNELS].copy_from_slice(&color);
                let depth = depth_plane(peer, &depth_bytes, span_hi - span_lo)?;
                output.depth[span_lo..span_hi].copy_from_slice(&depth);
            }
        } else {
            group.send(0, TAG_COLOR, &self.work_color[lo * CHANNELS..hi * CHANNELS])?;
            group.send(
                0,
                TAG_DEPTH,
                bytemuck::cast_slice(&self.work_depth[lo..hi]),
            )?;
        }
        Ok(())
    }
}

/// Validates and converts a received depth plane.
fn depth_plane(peer: usize, bytes: &[u8], pixels: usize) -> Result<Vec<f32>, CompositeError> {
    if bytes.len() != pixels * 4 {
        return Err(CompositeError::BadContribution {
            peer,
            got: bytes.len(),
            expected: pixels * 4,
        });
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// The tile a subgroup rank holds after all halving rounds.
fn final_span(rank: usize, rounds: u32, pixels: usize) -> (usize, usize) {
    let (mut lo, mut hi) = (0usize, pixels);
    for k in 0..rounds {
        let mid = lo + (hi - lo) / 2;
        if rank & (1usize << k) == 0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    (lo, hi)
}

/// Merges contribution B into the held span A under the given mode.
///
/// `b_is_senior` marks B as coming from a lower rank than A, giving it the
/// tie-breaking "A" role so any exchange order folds like ascending ranks.
pub fn merge_span(
    color_a: &mut [u8],
    depth_a: &mut [f32],
    color_b: &[u8],
    depth_b: &[f32],
    mode: CompositeMode,
    b_is_senior: bool,
) {
    debug_assert_eq!(color_a.len(), color_b.len());
    debug_assert_eq!(depth_a.len(), depth_b.len());
    debug_assert_eq!(color_a.len(), depth_a.len() * CHANNELS);

    for i in 0..depth_a.len() {
        let da = depth_a[i];
        let db = depth_b[i];
        let ca = &mut color_a[i * CHANNELS..(i + 1) * CHANNELS];
        let cb = &color_b[i * CHANNELS..(i + 1) * CHANNELS];

        match mode {
            CompositeMode::MinDepth => {
                let take_b = if b_is_senior { db <= da } else { db < da };
                if take_b {
                    ca.copy_from_slice(cb);
                    depth_a[i] = db;
                }
            }
            CompositeMode::AlphaBlend => {
                let pa = decode(ca);
                let pb = decode(cb);
                let b_near = if b_is_senior { db <= da } else { db < da };
                let (near, far, depth) = if b_near { (pb, pa, db) } else { (pa, pb, da) };
                encode(ca, over_premultiplied(near, far));
                depth_a[i] = depth;
            }
            CompositeMode::MaxIntensity => {
                for c in 0..3 {
                    ca[c] = ca[c].max(cb[c]);
                }
                ca[3] = ca[3].max(cb[3]);
                depth_a[i] = da.min(db);
            }
        }
    }
}

#[inline]
fn decode(c: &[u8]) -> Vec4 {
    Vec4::new(
        c[0] as f32 / 255.0,
        c[1] as f32 / 255.0,
        c[2] as f32 / 255.0,
        c[3] as f32 / 255.0,
    )
}

#[inline]
fn encode(out: &mut [u8], v: Vec4) {
    out[0] = encode_channel(v.x);
    out[1] = encode_channel(v.y);
    out[2] = encode_channel(v.z);
    out[3] = encode_channel(v.w);
}
