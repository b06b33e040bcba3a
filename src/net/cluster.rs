//! Cluster peer topology and outbound link management.
//!
//! Every pair of cluster members is joined by exactly one TCP link. The
//! node with the numerically larger id dials; the other side just accepts.
//! This symmetry-breaking rule prevents duplicate links without any
//! coordination.
//!
//! Outbound links are self-healing: a failed connect attempt, or an
//! established link that drops, is retried with exponential backoff plus
//! jitter so that a restarting peer is not hammered in lockstep by the
//! whole cluster.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::*;
use mio::net::TcpStream;
use rand::Rng;

use crate::config::Limits;

/// One peer in the cluster topology: identity plus address. Owned by the
/// server for its entire lifetime, whether or not a live connection to the
/// peer currently exists.
#[derive(Clone, Debug)]
pub struct ClusterNode {
    id: u32,
    address: String,
}

impl ClusterNode {
    pub fn new(id: u32, address: String) -> ClusterNode {
        ClusterNode { id, address }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the node with `own_id` is the one that dials `peer_id`.
    pub fn initiates(own_id: u32, peer_id: u32) -> bool {
        own_id > peer_id
    }

    /// Start a non-blocking connect to this peer. Completion (or failure)
    /// is reported through the event loop as writability on the stream.
    pub fn connect(&self, use_ipv4: bool, use_ipv6: bool) -> io::Result<TcpStream> {
        let addr = resolve(&self.address, use_ipv4, use_ipv6)?;
        TcpStream::connect(addr)
    }
}

/// Resolve an address string to the first usable socket address for the
/// configured family preference.
pub(crate) fn resolve(address: &str, use_ipv4: bool, use_ipv6: bool) -> io::Result<SocketAddr> {
    let addrs = address.to_socket_addrs()?;
    for addr in addrs {
        match addr {
            SocketAddr::V4(_) if use_ipv4 => return Ok(addr),
            SocketAddr::V6(_) if use_ipv6 => return Ok(addr),
            _ => continue,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no usable address for {}", address),
    ))
}

/// Dialing state for one peer this node is responsible for connecting to.
pub struct PeerLink {
    node: ClusterNode,
    attempts: u32,
    next_attempt: Instant,
    connected: bool,
}

impl PeerLink {
    pub fn new(node: ClusterNode) -> PeerLink {
        PeerLink {
            node,
            attempts: 0,
            next_attempt: Instant::now(),
            connected: false,
        }
    }

    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a connect attempt is due.
    pub fn due(&self, now: Instant) -> bool {
        !self.connected && now >= self.next_attempt
    }

    /// When the next attempt is due, if the link is down.
    pub fn next_attempt(&self) -> Option<Instant> {
        if self.connected {
            None
        } else {
            Some(self.next_attempt)
        }
    }

    /// An outbound connection to this peer is in place.
    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.attempts = 0;
    }

    /// The link dropped (connect failure or established connection closed);
    /// schedule the next attempt with backoff.
    pub fn mark_disconnected(&mut self, limits: &Limits) {
        self.connected = false;
        let base = Duration::from_millis(limits.reconnect_base_ms);
        let cap = Duration::from_millis(limits.reconnect_max_ms);
        let backoff = base
            .saturating_mul(1u32.checked_shl(self.attempts).unwrap_or(u32::MAX))
            .min(cap);
        // Up to 20% jitter so peers do not retry in lockstep.
        let jitter = backoff.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
        self.next_attempt = Instant::now() + backoff + jitter;
        self.attempts = self.attempts.saturating_add(1);
        debug!(
            "peer {} link down; retrying in {:?}",
            self.node.id(),
            backoff + jitter
        );
    }
}
