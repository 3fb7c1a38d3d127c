//! Interactive control channel.
//!
//! Rank 0 runs a line-oriented TCP server on loopback. Clients send
//! newline-terminated commands (`TIMESTEP`, `QUALITY`, `BIOELECTRIC`,
//! `CAMERA`); each recognized command updates the shared [`ControlState`]
//! under its mutex and fires the `on_update` callback. Unknown commands are
//! ignored. The render thread never talks to sockets here: once per frame
//! it snapshots the state and broadcasts the packed form to the group.

use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;

use volfield::BioelectricState;

/// Fixed-size prefix of an encoded snapshot: two matrices, viewport,
/// timestep and quality.
const SNAPSHOT_FIXED_BYTES: usize = 16 * 4 + 16 * 4 + 2 * 4 + 4 + 4;

/// Per-frame knobs owned by rank 0 and broadcast to the group.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    /// Row-major projection matrix.
    pub projection: [f32; 16],
    /// Row-major view matrix.
    pub view: [f32; 16],
    /// Width and height in pixels.
    pub viewport: [u32; 2],
    pub time_step: i32,
    /// 0 = low, 1 = medium, 2 = high.
    pub quality: u8,
    /// Raw bioelectric JSON, validated but not interpreted here.
    pub bio_params: Option<String>,
}

impl Default for ControlState {
    fn default() -> Self {
        let mut identity = [0.0f32; 16];
        for i in (0..16).step_by(5) {
            identity[i] = 1.0;
        }
        Self {
            projection: identity,
            view: identity,
            viewport: [1280, 720],
            time_step: 0,
            quality: 1,
            bio_params: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot too short: {0} bytes")]
    Truncated(usize),
    #[error("bio blob length {len} exceeds remaining {remaining} bytes")]
    BadBioLength { len: usize, remaining: usize },
    #[error("bio blob is not utf-8")]
    BadBioText(#[from] std::string::FromUtf8Error),
}

impl ControlState {
    /// Packs the snapshot for broadcast: 32 matrix floats, viewport,
    /// timestep, quality, then the bio blob length-prefixed only when
    /// present.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            SNAPSHOT_FIXED_BYTES + self.bio_params.as_ref().map_or(0, |b| 4 + b.len()),
        );
        for v in self.projection.iter().chain(&self.view) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.viewport {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.time_step.to_le_bytes());
        out.extend_from_slice(&(self.quality as u32).to_le_bytes());
        if let Some(bio) = &self.bio_params {
            out.extend_from_slice(&(bio.len() as u32).to_le_bytes());
            out.extend_from_slice(bio.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < SNAPSHOT_FIXED_BYTES {
            return Err(SnapshotError::Truncated(bytes.len()));
        }
        let mut state = Self::default();
        let mut off = 0;
        let read_f32 = |off: &mut usize| {
            let v = f32::from_le_bytes([
                bytes[*off],
                bytes[*off + 1],
                bytes[*off + 2],
                bytes[*off + 3],
            ]);
            *off += 4;
            v
        };
        for v in state.projection.iter_mut() {
            *v = read_f32(&mut off);
        }
        for v in state.view.iter_mut() {
            *v = read_f32(&mut off);
        }
        let read_u32 = |off: &mut usize| {
            let v = u32::from_le_bytes([
                bytes[*off],
                bytes[*off + 1],
                bytes[*off + 2],
                bytes[*off + 3],
            ]);
            *off += 4;
            v
        };
        state.viewport = [read_u32(&mut off), read_u32(&mut off)];
        state.time_step = read_u32(&mut off) as i32;
        state.quality = read_u32(&mut off) as u8;

        if off < bytes.len() {
            let len = read_u32(&mut off) as usize;
            let remaining = bytes.len() - off;
            if len != remaining {
                return Err(SnapshotError::BadBioLength { len, remaining });
            }
            state.bio_params = Some(String::from_utf8(bytes[off..].to_vec())?);
        }
        Ok(state)
    }

    /// Applies one protocol line. Returns true when the line changed state.
    fn apply_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\r', '\n']);
        let (cmd, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim_start()),
            None => (line, ""),
        };
        match cmd {
            "TIMESTEP" => match rest.parse::<i32>() {
                Ok(t) if t >= 0 => {
                    self.time_step = t;
                    true
                }
                _ => false,
            },
            "QUALITY" => {
                self.quality = match rest {
                    "low" => 0,
                    "high" => 2,
                    _ => 1,
                };
                true
            }
            "BIOELECTRIC" => {
                // Validate once at the boundary; a broken blob keeps the
                // last good parameters.
                match BioelectricState::from_json(rest) {
                    Ok(_) => {
                        self.bio_params = Some(rest.to_owned());
                        true
                    }
                    Err(error) => {
                        tracing::warn!(%error, "rejecting malformed bioelectric params");
                        false
                    }
                }
            }
            "CAMERA" => self.apply_camera_line(rest),
            _ => false,
        }
    }

    /// `CAMERA <16 comma-floats>;<16 comma-floats>;<w> <h>`
    fn apply_camera_line(&mut self, rest: &str) -> bool {
        let mut parts = rest.splitn(3, ';');
        let (Some(proj), Some(view), Some(tail)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let (Some(projection), Some(view)) = (parse_matrix(proj), parse_matrix(view)) else {
            return false;
        };
        let mut dims = tail.split_whitespace();
        let (Some(w), Some(h)) = (
            dims.next().and_then(|s| s.parse::<u32>().ok()),
            dims.next().and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return false;
        };
        if w == 0 || h == 0 {
            return false;
        }
        self.projection = projection;
        self.view = view;
        self.viewport = [w, h];
        true
    }
}

fn parse_matrix(csv: &str) -> Option<[f32; 16]> {
    let mut out = [0.0f32; 16];
    let mut count = 0;
    for token in csv.split(',') {
        if count == 16 {
            return None;
        }
        out[count] = token.trim().parse::<f32>().ok()?;
        count += 1;
    }
    (count == 16).then_some(out)
}

/// The control server thread. Owned by rank 0; stopped by closing the
/// listener (pending reads see EOF and the thread exits).
pub struct ControlServer {
    state: Arc<Mutex<ControlState>>,
    running: Arc<AtomicBool>,
    port: u16,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `127.0.0.1:port` and starts serving commands on top of the
    /// given initial state.
    pub fn start(
        port: u16,
        initial: ControlState,
        on_update: impl Fn(&ControlState) + Send + 'static,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let state = Arc::new(Mutex::new(initial));
        let running = Arc::new(AtomicBool::new(true));

        let thread_state = state.clone();
        let thread_running = running.clone();
        let thread = std::thread::Builder::new()
            .name("control-server".into())
            .spawn(move || {
                tracing::info!(port, "control server listening");
                while thread_running.load(Ordering::Acquire) {
                    let Ok((stream, addr)) = listener.accept() else {
                        continue;
                    };
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::info!(client = %addr, "control client connected");
                    serve_client(stream, &thread_state, &on_update, &thread_running);
                    tracing::info!(client = %addr, "control client disconnected");
                }
            })?;

        Ok(Self {
            state,
            running,
            port,
            thread: Some(thread),
        })
    }

    /// Copies the current state.
    pub fn state(&self) -> ControlState {
        self.state.lock().clone()
    }

    /// Stops the accept loop and joins the thread.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept with a throwaway connection.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_client(
    stream: TcpStream,
    state: &Mutex<ControlState>,
    on_update: &impl Fn(&ControlState),
    running: &AtomicBool,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if !running.load(Ordering::Acquire) {
            break;
        }
        let mut guard = state.lock();
        if guard.apply_line(&line) {
            let snapshot = guard.clone();
            drop(guard);
            on_update(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicU16;
    use std::time::{Duration, Instant};

    static NEXT_PORT: AtomicU16 = AtomicU16::new(42300);

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for state");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn start_server() -> (ControlServer, TcpStream) {
        let port = NEXT_PORT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let server = ControlServer::start(port, ControlState::default(), |_| {}).unwrap();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        (server, client)
    }

    #[test]
    fn timestep_and_quality_commands_update_state() {
        let (server, mut client) = start_server();
        client.write_all(b"QUALITY high\nTIMESTEP 7\n").unwrap();
        wait_for(|| {
            let s = server.state();
            s.quality == 2 && s.time_step == 7
        });
    }

    #[test]
    fn negative_timestep_is_ignored() {
        let (server, mut client) = start_server();
        client.write_all(b"TIMESTEP 5\nTIMESTEP -3\n").unwrap();
        wait_for(|| server.state().time_step == 5);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(server.state().time_step, 5);
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let (server, mut client) = start_server();
        client.write_all(b"FLY to the moon\nTIMESTEP 2\n").unwrap();
        wait_for(|| server.state().time_step == 2);
    }

    #[test]
    fn camera_command_round_trips_exactly() {
        let (server, mut client) = start_server();
        let proj: Vec<f32> = (0..16).map(|i| 0.125 * i as f32 + 0.001).collect();
        let view: Vec<f32> = (0..16).map(|i| -1.5 * i as f32 - 0.25).collect();
        let fmt = |m: &[f32]| {
            m.iter()
                .map(|v| format!("{v}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        let line = format!("CAMERA {};{};640 480\n", fmt(&proj), fmt(&view));
        client.write_all(line.as_bytes()).unwrap();

        wait_for(|| server.state().viewport == [640, 480]);
        let state = server.state();
        assert_eq!(&state.projection[..], &proj[..]);
        assert_eq!(&state.view[..], &view[..]);
    }

    #[test]
    fn malformed_camera_line_is_ignored() {
        let (server, mut client) = start_server();
        client
            .write_all(b"CAMERA 1,2,3;4,5,6;640 480\nTIMESTEP 9\n")
            .unwrap();
        wait_for(|| server.state().time_step == 9);
        assert_eq!(server.state().viewport, [1280, 720]);
    }

    #[test]
    fn bad_bioelectric_json_keeps_last_good_value() {
        let (server, mut client) = start_server();
        client
            .write_all(b"BIOELECTRIC {\"ionConcentrations\":{\"sodium\":100}}\n")
            .unwrap();
        wait_for(|| server.state().bio_params.is_some());
        client.write_all(b"BIOELECTRIC not json at all\n").unwrap();
        client.write_all(b"TIMESTEP 1\n").unwrap();
        wait_for(|| server.state().time_step == 1);
        let bio = server.state().bio_params.unwrap();
        assert!(bio.contains("sodium"));
    }

    #[test]
    fn snapshot_codec_round_trips() {
        let mut state = ControlState::default();
        state.projection[3] = 42.5;
        state.view[12] = -7.25;
        state.viewport = [320, 200];
        state.time_step = 11;
        state.quality = 2;
        state.bio_params = Some(r#"{"gapJunctions":{"enabled":false}}"#.into());

        let decoded = ControlState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn snapshot_without_bio_blob_is_shorter() {
        let state = ControlState::default();
        let bytes = state.encode();
        assert_eq!(bytes.len(), SNAPSHOT_FIXED_BYTES);
        let decoded = ControlState::decode(&bytes).unwrap();
        assert!(decoded.bio_params.is_none());
    }

    #[test]
    fn truncated_snapshot_is_rejected() {
        assert!(matches!(
            ControlState::decode(&[0u8; 10]),
            Err(SnapshotError::Truncated(10))
        ));
    }
}
