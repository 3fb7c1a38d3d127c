//! PNG frame sink.
//!
//! Consumes rank 0's composited frame, converts premultiplied RGBA back to
//! straight alpha and writes `composited/frame_%06d.png` under the output
//! directory. The un-premultiply is lossy at the 8-bit boundary: a channel
//! can exceed its alpha after premultiplied `over`, and such values clamp
//! to 255.

use std::fs;
use std::path::PathBuf;

use image::{ImageBuffer, Rgba};
use thiserror::Error;

use crate::frame::{Frame, CHANNELS};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("png encoding failed: {0}")]
    Png(#[from] image::ImageError),
    #[error("frame buffer does not match its dimensions")]
    Geometry,
}

pub struct FrameSink {
    output_dir: PathBuf,
}

impl FrameSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Encodes one frame, creating the `composited/` directory on demand.
    /// Returns the written path.
    pub fn write_frame(&self, frame: &Frame, frame_number: u64) -> Result<PathBuf, EncodeError> {
        let dir = self.output_dir.join("composited");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("frame_{frame_number:06}.png"));

        let straight = unpremultiply(&frame.color);
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width(), frame.height(), straight)
                .ok_or(EncodeError::Geometry)?;
        img.save(&path)?;
        Ok(path)
    }
}

/// Premultiplied to straight alpha; fully transparent pixels zero out.
fn unpremultiply(color: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; color.len()];
    for (src, dst) in color
        .chunks_exact(CHANNELS)
        .zip(out.chunks_exact_mut(CHANNELS))
    {
        let a = src[3];
        if a > 0 {
            let af = a as f32 / 255.0;
            dst[0] = (src[0] as f32 / af).min(255.0) as u8;
            dst[1] = (src[1] as f32 / af).min(255.0) as u8;
            dst[2] = (src[2] as f32 / af).min(255.0) as u8;
            dst[3] = a;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> Frame {
        let mut frame = Frame::new(4, 3);
        frame.clear();
        for i in 0..frame.pixel_count() {
            // Premultiplied: channels never exceed alpha.
            let a = (40 * i % 256) as u8;
            let c = &mut frame.color[i * CHANNELS..(i + 1) * CHANNELS];
            c[0] = a / 2;
            c[1] = a / 3;
            c[2] = a;
            c[3] = a;
        }
        frame
    }

    #[test]
    fn writes_into_composited_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path());
        let path = sink.write_frame(&test_frame(), 17).unwrap();
        assert_eq!(
            path,
            dir.path().join("composited").join("frame_000017.png")
        );
        assert!(path.exists());
    }

    #[test]
    fn png_round_trips_within_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new(dir.path());
        let frame = test_frame();
        let path = sink.write_frame(&frame, 0).unwrap();

        let decoded = image::open(&path).unwrap().into_rgba8();
        assert_eq!(decoded.dimensions(), (4, 3));

        // Re-premultiply the decoded image and compare to the original.
        for (i, px) in decoded.pixels().enumerate() {
            let a = px.0[3] as f32 / 255.0;
            for c in 0..3 {
                let back = (px.0[c] as f32 * a).round() as i32;
                let orig = frame.color[i * CHANNELS + c] as i32;
                assert!(
                    (back - orig).abs() <= 1,
                    "pixel {i} channel {c}: {back} vs {orig}"
                );
            }
            assert_eq!(px.0[3], frame.color[i * CHANNELS + 3]);
        }
    }

    #[test]
    fn transparent_pixels_zero_their_color() {
        let mut frame = Frame::new(1, 1);
        frame.color = vec![120, 130, 140, 0];
        let straight = unpremultiply(&frame.color);
        assert_eq!(straight, vec![0, 0, 0, 0]);
    }
}
