//! Membrane-potential transfer function.
//!
//! Maps normalized potential onto four fixed color bands: hyperpolarized
//! tissue reads blue/purple, resting tissue green/cyan, mild depolarization
//! yellow, and strong depolarization (wound/tumor signatures) red/orange.
//! Output is straight-alpha RGBA; the marcher premultiplies during
//! accumulation.

use glam::Vec4;

#[derive(Debug, Clone, Copy)]
pub struct TransferFunction {
    data_range: [f32; 2],
}

impl Default for TransferFunction {
    fn default() -> Self {
        Self {
            data_range: [0.0, 1.0],
        }
    }
}

impl TransferFunction {
    /// A transfer function remapping `range` onto the color bands.
    /// Returns `None` unless `range[0] < range[1]`.
    pub fn with_range(range: [f32; 2]) -> Option<Self> {
        (range[0] < range[1]).then_some(Self { data_range: range })
    }

    #[inline]
    pub fn data_range(&self) -> [f32; 2] {
        self.data_range
    }

    /// Straight-alpha RGBA for a field sample.
    pub fn evaluate(&self, value: f32) -> Vec4 {
        let [lo, hi] = self.data_range;
        let v = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);

        if v < 0.3 {
            // Hyperpolarized (very negative Vmem).
            let t = v / 0.3;
            Vec4::new(0.1 + t * 0.2, 0.0, 0.5 + t * 0.5, 0.2 + t * 0.3)
        } else if v < 0.5 {
            // Resting potential.
            let t = (v - 0.3) / 0.2;
            Vec4::new(0.0, 0.5 + t * 0.3, 0.5 - t * 0.3, 0.5 + t * 0.2)
        } else if v < 0.7 {
            // Slightly depolarized.
            let t = (v - 0.5) / 0.2;
            Vec4::new(0.5 + t * 0.5, 0.8, 0.2 - t * 0.2, 0.7)
        } else {
            // Strongly depolarized.
            let t = (v - 0.7) / 0.3;
            Vec4::new(1.0, 0.8 - t * 0.6, 0.0, 0.7 + t * 0.3)
        }
    }
}
