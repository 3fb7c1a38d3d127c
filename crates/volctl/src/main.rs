use std::io::Write;
use std::net::TcpStream;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use render_peer::camera::{mat_to_row_major, orbit_camera};

/// `volctl` - drive a running renderer over its control protocol.
///
/// Connects to rank 0's loopback control port and sends one line-protocol
/// command per invocation.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Control endpoint of the rank-0 peer.
    #[arg(long, default_value = "127.0.0.1:9090")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Jump the renderer to a time step.
    Timestep { step: u32 },

    /// Switch the quality tier.
    Quality {
        #[arg(value_enum)]
        tier: Tier,
    },

    /// Send raw bioelectric parameter JSON.
    Bioelectric { json: String },

    /// Point the shared camera at an orbit position (same framing as the
    /// batch animator, so stills are reproducible).
    Camera {
        /// Orbit fraction in [0,1): 0 looks down +x, 0.25 down +z.
        #[arg(long, default_value_t = 0.0)]
        orbit: f32,

        #[arg(long, default_value_t = 1280)]
        width: u32,

        #[arg(long, default_value_t = 720)]
        height: u32,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Tier {
    Low,
    Medium,
    High,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let line = match &args.command {
        Command::Timestep { step } => format!("TIMESTEP {step}"),
        Command::Quality { tier } => {
            let word = match tier {
                Tier::Low => "low",
                Tier::Medium => "medium",
                Tier::High => "high",
            };
            format!("QUALITY {word}")
        }
        Command::Bioelectric { json } => format!("BIOELECTRIC {json}"),
        Command::Camera {
            orbit,
            width,
            height,
        } => {
            let camera = orbit_camera(*orbit, *width, *height);
            let csv = |m: &[f32; 16]| {
                m.iter()
                    .map(|v| format!("{v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            format!(
                "CAMERA {};{};{} {}",
                csv(&mat_to_row_major(&camera.projection)),
                csv(&mat_to_row_major(&camera.view)),
                width,
                height
            )
        }
    };

    let mut stream = TcpStream::connect(&args.addr)
        .with_context(|| format!("failed to reach the renderer at {}", args.addr))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .context("failed to send the command")?;

    println!("sent: {line}");
    Ok(())
}
