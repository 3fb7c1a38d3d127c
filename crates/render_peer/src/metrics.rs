//! Prometheus metrics for one rendering peer.
//!
//! Registered with a `rank` const label and served on an optional listen
//! address from a dedicated thread, so the render pipeline never touches
//! the HTTP stack.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

pub struct PeerMetrics {
    pub registry: Registry,
    pub frame_seconds: Gauge,
    pub frames_rendered: IntCounter,
    pub frames_encoded: IntCounter,
    pub frames_skipped: IntCounter,
}

impl PeerMetrics {
    pub fn new(rank: usize) -> Self {
        let registry = Registry::new_custom(Some("render_peer".into()), None).unwrap();
        let rank_str = rank.to_string();

        macro_rules! reg {
            ($ctor:path, $name:expr, $help:expr) => {{
                let metric = $ctor(
                    prometheus::Opts::new($name, $help).const_label("rank", &rank_str),
                )
                .unwrap();
                registry.register(Box::new(metric.clone())).unwrap();
                metric
            }};
        }

        Self {
            frame_seconds: reg!(
                Gauge::with_opts,
                "peer_frame_seconds",
                "Render plus composite duration of the last frame in seconds."
            ),
            frames_rendered: reg!(
                IntCounter::with_opts,
                "peer_frames_rendered_total",
                "Frames this peer has rendered and composited."
            ),
            frames_encoded: reg!(
                IntCounter::with_opts,
                "peer_frames_encoded_total",
                "Frames written to disk (rank 0 only)."
            ),
            frames_skipped: reg!(
                IntCounter::with_opts,
                "peer_frames_skipped_total",
                "Frames dropped because of render, composite or encode errors."
            ),
            registry,
        }
    }

    /// Router serving the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = registry.clone();
                async move {
                    let families = reg.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder.encode(&families, &mut buffer).unwrap();
                    String::from_utf8(buffer).unwrap().into_response()
                }
            }),
        )
    }
}

/// Serves the metrics endpoint from its own thread with a current-thread
/// runtime, leaving the render pipeline synchronous.
pub fn spawn_server(metrics: Arc<PeerMetrics>, addr: SocketAddr) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("metrics-server".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(error) => {
                    tracing::error!(%error, "failed to build metrics runtime");
                    return;
                }
            };
            rt.block_on(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        tracing::info!(%addr, "metrics server started");
                        if let Err(error) = axum::serve(listener, metrics.router()).await {
                            tracing::error!(%error, "metrics server exited");
                        }
                    }
                    Err(error) => {
                        tracing::error!(%addr, %error, "failed to bind metrics listener");
                    }
                }
            });
        })
        .expect("spawn metrics thread")
}
