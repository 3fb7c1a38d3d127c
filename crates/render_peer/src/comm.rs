//! Collective communication for the peer group.
//!
//! The group is a fixed full mesh over TCP: rank r listens on
//! `base_port + r`, dials every lower rank, and accepts from every higher
//! rank, so each pair shares exactly one ordered stream. On top of that the
//! renderer needs only four primitives: tagged point-to-point send/recv,
//! broadcast from a root, and a barrier. All calls block; any socket
//! failure is fatal for the in-flight frame.
//!
//! Messages are framed `tag: u32 LE, len: u32 LE, payload`. Receives are
//! tag-matched: a frame arriving with a different tag is parked on a small
//! pending queue for the later matching `recv`, so color and depth planes
//! may be posted in either order.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use thiserror::Error;

pub const TAG_COLOR: u32 = 1;
pub const TAG_DEPTH: u32 = 2;
pub const TAG_BCAST: u32 = 3;
pub const TAG_BARRIER: u32 = 4;

const HELLO_MAGIC: u32 = 0x564f_4c50; // "VOLP"
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_RETRY: Duration = Duration::from_millis(50);
/// Upper bound on a single message; a 4K RGBA plane is ~33 MB.
const MAX_PAYLOAD: usize = 1 << 28;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("mesh setup failed: {0}")]
    Setup(#[from] std::io::Error),
    #[error("i/o failure on link to peer {peer}: {source}")]
    Peer {
        peer: usize,
        source: std::io::Error,
    },
    #[error("timed out dialing peer {peer} on port {port}")]
    DialTimeout { peer: usize, port: u16 },
    #[error("handshake from {addr} carried bad magic or rank {rank}")]
    BadHello { addr: String, rank: u32 },
    #[error("peer {peer} sent an oversized frame: tag {tag}, {len} bytes")]
    Oversized { peer: usize, tag: u32, len: usize },
}

struct Link {
    stream: TcpStream,
    /// Frames read while waiting for a different tag.
    parked: VecDeque<(u32, Vec<u8>)>,
}

/// A connected lockstep peer group.
pub struct PeerGroup {
    rank: usize,
    size: usize,
    links: Vec<Option<Link>>,
}

impl PeerGroup {
    /// Builds the mesh. Every member must call this with the same `size`,
    /// `host` and `base_port`; the call blocks until all links are up.
    pub fn connect(rank: usize, size: usize, host: &str, base_port: u16) -> Result<Self, CommError> {
        assert!(rank < size, "rank {rank} out of range for group of {size}");

        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
        if size == 1 {
            return Ok(Self { rank, size, links });
        }

        let my_port = base_port + rank as u16;
        let listener = TcpListener::bind((host, my_port))?;

        // Dial lower ranks. Peers start at different times, so retry until
        // the deadline.
        for peer in 0..rank {
            let port = base_port + peer as u16;
            let deadline = Instant::now() + CONNECT_TIMEOUT;
            let stream = loop {
                match TcpStream::connect((host, port)) {
                    Ok(s) => break s,
                    Err(_) if Instant::now() < deadline => std::thread::sleep(DIAL_RETRY),
                    Err(_) => return Err(CommError::DialTimeout { peer, port }),
                }
            };
            stream.set_nodelay(true).map_err(|e| peer_err(peer, e))?;
            let mut hello = [0u8; 8];
            hello[..4].copy_from_slice(&HELLO_MAGIC.to_le_bytes());
            hello[4..].copy_from_slice(&(rank as u32).to_le_bytes());
            let mut s = stream;
            s.write_all(&hello).map_err(|e| peer_err(peer, e))?;
            links[peer] = Some(Link {
                stream: s,
                parked: VecDeque::new(),
            });
        }

        // Accept the higher ranks, identified by their hello.
        let expected = size - rank - 1;
        for _ in 0..expected {
            let (mut stream, addr) = listener.accept()?;
            let mut hello = [0u8; 8];
            stream.read_exact(&mut hello)?;
            let magic = u32::from_le_bytes([hello[0], hello[1], hello[2], hello[3]]);
            let peer_rank = u32::from_le_bytes([hello[4], hello[5], hello[6], hello[7]]);
            if magic != HELLO_MAGIC || (peer_rank as usize) <= rank || peer_rank as usize >= size {
                return Err(CommError::BadHello {
                    addr: addr.to_string(),
                    rank: peer_rank,
                });
            }
            stream.set_nodelay(true)?;
            links[peer_rank as usize] = Some(Link {
                stream,
                parked: VecDeque::new(),
            });
        }

        tracing::debug!(rank, size, "peer mesh connected");
        Ok(Self { rank, size, links })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn link(&mut self, peer: usize) -> &mut Link {
        self.links[peer]
            .as_mut()
            .unwrap_or_else(|| panic!("no link to peer {peer}"))
    }

    /// Sends one tagged message to a peer.
    pub fn send(&mut self, peer: usize, tag: u32, payload: &[u8]) -> Result<(), CommError> {
        let link = self.link(peer);
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&tag.to_le_bytes());
        header[4..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        link.stream
            .write_all(&header)
            .and_then(|_| link.stream.write_all(payload))
            .map_err(|e| peer_err(peer, e))
    }

    /// Receives the next message with `tag` from a peer, parking frames that
    /// arrive under other tags.
    pub fn recv(&mut self, peer: usize, tag: u32) -> Result<Vec<u8>, CommError> {
        let link = self.link(peer);
        // Queue order within a tag is arrival order.
        if let Some(idx) = link.parked.iter().position(|(t, _)| *t == tag) {
            if let Some((_, payload)) = link.parked.remove(idx) {
                return Ok(payload);
            }
        }

        loop {
            let mut header = [0u8; 8];
            link.stream
                .read_exact(&mut header)
                .map_err(|e| peer_err(peer, e))?;
            let got_tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if len > MAX_PAYLOAD {
                return Err(CommError::Oversized {
                    peer,
                    tag: got_tag,
                    len,
                });
            }
            let mut payload = vec![0u8; len];
            link.stream
                .read_exact(&mut payload)
                .map_err(|e| peer_err(peer, e))?;
            if got_tag == tag {
                return Ok(payload);
            }
            link.parked.push_back((got_tag, payload));
        }
    }

    /// Broadcast from `root`: the root fans its payload out and gets it
    /// back; everyone else ignores their argument and receives the root's.
    pub fn broadcast(&mut self, root: usize, payload: &[u8]) -> Result<Vec<u8>, CommError> {
        if self.size == 1 {
            return Ok(payload.to_vec());
        }
        if self.rank == root {
            for peer in 0..self.size {
                if peer != root {
                    self.send(peer, TAG_BCAST, payload)?;
                }
            }
            Ok(payload.to_vec())
        } else {
            self.recv(root, TAG_BCAST)
        }
    }

    /// Blocks until every member of the group has arrived.
    pub fn barrier(&mut self) -> Result<(), CommError> {
        if self.size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for peer in 1..self.size {
                self.recv(peer, TAG_BARRIER)?;
            }
            for peer in 1..self.size {
                self.send(peer, TAG_BARRIER, &[])?;
            }
        } else {
            self.send(0, TAG_BARRIER, &[])?;
            self.recv(0, TAG_BARRIER)?;
        }
        Ok(())
    }
}

#[inline]
fn peer_err(peer: usize, source: std::io::Error) -> CommError {
    CommError::Peer { peer, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    // Each test gets its own port range so they can run in parallel.
    static NEXT_BASE: AtomicU16 = AtomicU16::new(41200);

    fn base_port() -> u16 {
        NEXT_BASE.fetch_add(32, Ordering::SeqCst)
    }

    fn spawn_group<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(PeerGroup) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let port = base_port();
        let f = std::sync::Arc::new(f);
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let f = f.clone();
                std::thread::spawn(move || {
                    let group = PeerGroup::connect(rank, size, "127.0.0.1", port).unwrap();
                    f(group)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn single_peer_needs_no_sockets() {
        let mut group = PeerGroup::connect(0, 1, "127.0.0.1", 1).unwrap();
        assert_eq!(group.broadcast(0, b"solo").unwrap(), b"solo");
        group.barrier().unwrap();
    }

    #[test]
    fn tagged_receive_matches_out_of_order() {
        let results = spawn_group(2, |mut group| {
            if group.rank() == 1 {
                // Post depth before color; the root asks for color first.
                group.send(0, TAG_DEPTH, b"depth-plane").unwrap();
                group.send(0, TAG_COLOR, b"color-plane").unwrap();
                Vec::new()
            } else {
                let color = group.recv(1, TAG_COLOR).unwrap();
                let depth = group.recv(1, TAG_DEPTH).unwrap();
                vec![color, depth]
            }
        });
        assert_eq!(results[0][0], b"color-plane");
        assert_eq!(results[0][1], b"depth-plane");
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let results = spawn_group(3, |mut group| {
            let payload = if group.rank() == 0 { b"snap".to_vec() } else { Vec::new() };
            group.broadcast(0, &payload).unwrap()
        });
        for got in results {
            assert_eq!(got, b"snap");
        }
    }

    #[test]
    fn barrier_completes_for_four_ranks() {
        let results = spawn_group(4, |mut group| {
            for _ in 0..3 {
                group.barrier().unwrap();
            }
            group.rank()
        });
        assert_eq!(results.len(), 4);
    }
}
