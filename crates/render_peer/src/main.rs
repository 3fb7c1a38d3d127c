use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use render_peer::camera::{mat_to_row_major, orbit_camera};
use render_peer::comm::PeerGroup;
use render_peer::compositor::CompositeParams;
use render_peer::config::Config;
use render_peer::control::{ControlServer, ControlState};
use render_peer::metrics::{self, PeerMetrics};
use render_peer::render::Renderer;
use render_peer::sink::FrameSink;
use volfield::DataLoader;

fn main() -> anyhow::Result<()> {
    // --- 1. Initialization ---
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    if let Err(reason) = config.validate() {
        anyhow::bail!("invalid configuration: {reason}");
    }

    let span = tracing::info_span!("peer", rank = config.rank);
    let _guard = span.enter();
    tracing::info!(config = ?config, "renderer starting");

    let peer_metrics = Arc::new(PeerMetrics::new(config.rank));
    if let Some(addr) = &config.metrics_addr {
        let addr = addr.parse().context("bad metrics listen address")?;
        metrics::spawn_server(peer_metrics.clone(), addr);
    }

    // --- 2. Peer mesh and renderer ---
    let mut group = PeerGroup::connect(
        config.rank,
        config.peers,
        &config.mesh_host,
        config.mesh_base_port,
    )
    .context("failed to build the peer mesh")?;
    tracing::info!(peers = config.peers, "peer mesh up");

    let loader = config.data.as_ref().map(DataLoader::new);
    let mut renderer = Renderer::new(
        config.rank,
        config.peers,
        config.width,
        config.height,
        CompositeParams {
            mode: config.composite_mode.into(),
        },
        loader,
        config.dataset.clone(),
    );
    let sink = FrameSink::new(&config.out);

    // --- 3. Frame loop ---
    if config.interactive {
        run_interactive(&config, &mut group, &mut renderer, &sink, &peer_metrics)
    } else {
        run_batch(&config, &mut group, &mut renderer, &sink, &peer_metrics)
    }
}

/// One full pipeline step: apply the snapshot, render, composite, encode on
/// rank 0, then meet at the barrier. Per-frame failures are logged and
/// skip the encode; collective failures propagate and end the run.
fn process_frame(
    group: &mut PeerGroup,
    renderer: &mut Renderer,
    sink: &FrameSink,
    peer_metrics: &PeerMetrics,
    snapshot: &ControlState,
    frame_number: u64,
) -> anyhow::Result<()> {
    let frame_start = Instant::now();

    let mut encode_ok = match renderer.apply_snapshot(snapshot) {
        Ok(()) => true,
        Err(error) => {
            tracing::error!(%error, frame_number, "snapshot rejected");
            false
        }
    };

    match renderer.render_frame(group) {
        Ok(rendered) => encode_ok &= rendered,
        Err(error) => {
            tracing::error!(%error, frame_number, "composite failed, skipping frame");
            encode_ok = false;
        }
    }

    peer_metrics
        .frame_seconds
        .set(frame_start.elapsed().as_secs_f64());
    peer_metrics.frames_rendered.inc();

    if group.rank() == 0 {
        if encode_ok {
            match sink.write_frame(renderer.output(), frame_number) {
                Ok(_) => {
                    peer_metrics.frames_encoded.inc();
                }
                Err(error) => {
                    tracing::error!(%error, frame_number, "frame encode failed");
                    peer_metrics.frames_skipped.inc();
                }
            }
        } else {
            peer_metrics.frames_skipped.inc();
        }
    }

    group.barrier().context("frame barrier failed")?;
    Ok(())
}

fn run_batch(
    config: &Config,
    group: &mut PeerGroup,
    renderer: &mut Renderer,
    sink: &FrameSink,
    peer_metrics: &PeerMetrics,
) -> anyhow::Result<()> {
    let start = Instant::now();

    for frame in 0..config.frames {
        // Rank 0 drives the shared orbit; everyone renders the same rays.
        let snapshot_bytes = if group.rank() == 0 {
            let camera = orbit_camera(
                frame as f32 / config.frames as f32,
                config.width,
                config.height,
            );
            ControlState {
                projection: mat_to_row_major(&camera.projection),
                view: mat_to_row_major(&camera.view),
                viewport: [config.width, config.height],
                time_step: config.timestep,
                quality: 1,
                bio_params: None,
            }
            .encode()
        } else {
            Vec::new()
        };
        let bytes = group
            .broadcast(0, &snapshot_bytes)
            .context("control broadcast failed")?;
        let snapshot = ControlState::decode(&bytes).context("corrupt control snapshot")?;

        process_frame(group, renderer, sink, peer_metrics, &snapshot, frame as u64)?;

        if group.rank() == 0 && frame % 10 == 0 {
            let elapsed = start.elapsed().as_secs_f64().max(1e-9);
            tracing::info!(
                frame,
                total = config.frames,
                fps = (frame + 1) as f64 / elapsed,
                "progress"
            );
        }
    }

    if group.rank() == 0 {
        let total = start.elapsed().as_secs_f64().max(1e-9);
        tracing::info!(
            frames = config.frames,
            seconds = total,
            avg_fps = config.frames as f64 / total,
            "rendering complete"
        );
    }
    Ok(())
}

fn run_interactive(
    config: &Config,
    group: &mut PeerGroup,
    renderer: &mut Renderer,
    sink: &FrameSink,
    peer_metrics: &PeerMetrics,
) -> anyhow::Result<()> {
    let (update_tx, update_rx) = crossbeam_channel::bounded::<()>(1);

    let server = if group.rank() == 0 {
        tracing::info!(port = config.port, "interactive mode, waiting for commands");
        let initial = ControlState {
            viewport: [config.width, config.height],
            time_step: config.timestep,
            ..ControlState::default()
        };
        Some(
            ControlServer::start(config.port, initial, move |_| {
                let _ = update_tx.try_send(());
            })
            .context("failed to start control server")?,
        )
    } else {
        None
    };

    let mut frame_number: u64 = 0;
    loop {
        let snapshot_bytes = match &server {
            Some(server) => server.state().encode(),
            None => Vec::new(),
        };
        let bytes = group
            .broadcast(0, &snapshot_bytes)
            .context("control broadcast failed")?;
        let snapshot = ControlState::decode(&bytes).context("corrupt control snapshot")?;

        process_frame(group, renderer, sink, peer_metrics, &snapshot, frame_number)?;
        frame_number += 1;

        // Rank 0 paces the group: re-render promptly on a control update,
        // otherwise tick at the refresh interval. Other ranks block on the
        // next broadcast.
        if group.rank() == 0 {
            let _ = update_rx.recv_timeout(Duration::from_millis(50));
        }
    }
}
