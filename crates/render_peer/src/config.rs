use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::compositor::CompositeMode;

/// `render_peer` - one peer of the sort-last volume rendering group.
///
/// Every peer ray-marches its share of the volume bricks into a local
/// frame; the group composites those frames image-space onto rank 0, which
/// encodes PNGs and, in interactive mode, hosts the control protocol.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Frame width in pixels.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Number of frames to render in batch mode.
    #[arg(long, default_value_t = 240)]
    pub frames: u32,

    /// Output directory; frames land in `<out>/composited/`.
    #[arg(long, default_value = "./output/frames")]
    pub out: PathBuf,

    /// Volume dataset root. When omitted, the procedural bioelectric
    /// tissue volume is rendered instead.
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Dataset name under the data root.
    #[arg(long, default_value = "default")]
    pub dataset: String,

    /// Initial time step.
    #[arg(long, default_value_t = 0)]
    pub timestep: i32,

    /// Serve the interactive control protocol instead of batch rendering.
    #[arg(long)]
    pub interactive: bool,

    /// Control protocol port on loopback (rank 0 only).
    #[arg(long, default_value_t = 9090)]
    pub port: u16,

    /// This peer's rank within the group.
    #[arg(long, env = "RENDER_PEER_RANK", default_value_t = 0)]
    pub rank: usize,

    /// Total number of peers in the group.
    #[arg(long, env = "RENDER_PEER_COUNT", default_value_t = 1)]
    pub peers: usize,

    /// Host the peer mesh binds and dials on.
    #[arg(long, env = "RENDER_PEER_HOST", default_value = "127.0.0.1")]
    pub mesh_host: String,

    /// First port of the peer mesh range; rank r listens on base + r.
    #[arg(long, env = "RENDER_PEER_BASE_PORT", default_value_t = 9400)]
    pub mesh_base_port: u16,

    /// Compositing operator.
    #[arg(long, value_enum, default_value_t = ModeArg::MinDepth)]
    pub composite_mode: ModeArg,

    /// Listen address for the Prometheus endpoint; omit to disable.
    #[arg(long, env = "RENDER_PEER_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

impl Config {
    /// Rejects configurations the pipeline cannot start from.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!("viewport {}x{} is empty", self.width, self.height));
        }
        if self.peers == 0 {
            return Err("peer count must be >= 1".into());
        }
        if self.rank >= self.peers {
            return Err(format!(
                "rank {} out of range for {} peers",
                self.rank, self.peers
            ));
        }
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ModeArg {
    MinDepth,
    AlphaBlend,
    MaxIntensity,
}

impl From<ModeArg> for CompositeMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::MinDepth => CompositeMode::MinDepth,
            ModeArg::AlphaBlend => CompositeMode::AlphaBlend,
            ModeArg::MaxIntensity => CompositeMode::MaxIntensity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let config = Config::parse_from(["render_peer"]);
        assert_eq!(config.width, 1280);
        assert_eq!(config.frames, 240);
        assert_eq!(config.port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let config = Config::parse_from(["render_peer", "--rank", "4", "--peers", "4"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_viewport_is_rejected() {
        let config = Config::parse_from(["render_peer", "--width", "0"]);
        assert!(config.validate().is_err());
    }
}
