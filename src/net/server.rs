//! Dispatch loop: accepts connections and routes readiness events.
//!
//! One dedicated thread runs the loop; connection state is never touched
//! from anywhere else, so no connection-level locking exists. The only
//! cross-thread interaction is the shutdown request, which sets a flag and
//! wakes the poller.
//!
//! Unexpected OS faults propagate out of `run` as errors; the caller is
//! expected to treat them as fatal and let a supervisor restart the
//! process. Swallowing them here would risk dispatching against a poll
//! instance in an unknown state.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};

use crate::config::Config;

use super::cluster::{resolve, ClusterNode, PeerLink};
use super::connection::Connection;
use super::poller::{Poller, Readiness, WAKER_TOKEN};

const LISTENER_TOKEN: Token = Token(0);
const FIRST_CONNECTION_TOKEN: usize = 1;

/// Cross-thread handle for stopping a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request an orderly shutdown. Safe to call from any thread; wakes the
    /// dispatch loop if it is blocked waiting for readiness.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            error!("problem waking dispatch loop for shutdown: {}", e);
        }
    }
}

struct Entry {
    conn: Connection<TcpStream>,
    /// Interest currently registered with the poller, kept in sync with the
    /// connection's own flags after every dispatch.
    registered: Option<Interest>,
}

/// Owns the poller, the listening socket, the live connection table, and
/// the cluster peer registry.
pub struct Server {
    cfg: Arc<Config>,
    poller: Poller,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<Token, Entry>,
    peers: Vec<PeerLink>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening socket and prepare dialing state for every peer
    /// this node is responsible for connecting to.
    pub fn new(cfg: Arc<Config>) -> io::Result<Server> {
        let bind_addr = resolve(&cfg.bind_address, cfg.use_ipv4, cfg.use_ipv6)?;
        let mut listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;

        let poller = Poller::new()?;
        poller.add(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let peers = cfg
            .hosts
            .iter()
            .filter(|(id, _)| **id != cfg.server_id && ClusterNode::initiates(cfg.server_id, **id))
            .map(|(id, address)| PeerLink::new(ClusterNode::new(*id, address.clone())))
            .collect();

        Ok(Server {
            cfg,
            poller,
            listener,
            local_addr,
            connections: HashMap::new(),
            peers,
            next_token: FIRST_CONNECTION_TOKEN,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address actually bound, which differs from the configured one
    /// when an ephemeral port was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: self.poller.waker(),
        }
    }

    /// Run the dispatch loop until a shutdown request arrives or a fatal
    /// error occurs.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            "listening on {} as server {} in cluster \"{}\"",
            self.local_addr, self.cfg.server_id, self.cfg.cluster_name
        );

        let mut ready: Vec<Readiness> = Vec::new();
        while !self.shutdown.load(Ordering::SeqCst) {
            self.drive_peer_connects();

            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            ready.clear();
            self.poller.wait(timeout, &mut ready)?;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            for r in &ready {
                match r.token {
                    WAKER_TOKEN => {} // shutdown flag is checked at the loop top
                    LISTENER_TOKEN => self.accept_batch()?,
                    token => self.dispatch(token, r.readable, r.writable)?,
                }
            }

            self.sweep_stalled_handshakes();
        }

        self.drain_and_close();
        info!("dispatch loop exited");
        Ok(())
    }

    /// Accept up to a bounded batch of pending connections so a busy accept
    /// queue cannot starve other ready descriptors.
    fn accept_batch(&mut self) -> io::Result<()> {
        let batch = self.cfg.limits.accept_batch;
        let mut accepted = 0;
        while accepted < batch {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    accepted += 1;
                    debug!("accepted connection from {}", peer_addr);
                    self.register_connection(Connection::new(stream), Interest::READABLE)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("problem accepting connection: {}", e);
                    return Ok(());
                }
            }
        }

        // The batch bound was hit with the queue possibly non-empty. The
        // registration is edge-triggered, so re-arm it to be notified again
        // without waiting for a new connection to arrive.
        self.poller
            .update(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
    }

    fn register_connection(
        &mut self,
        mut conn: Connection<TcpStream>,
        interest: Interest,
    ) -> io::Result<Token> {
        let token = self.alloc_token();
        self.poller
            .add(conn.socket_mut().stream_mut(), token, interest)?;
        self.connections.insert(
            token,
            Entry {
                conn,
                registered: Some(interest),
            },
        );
        Ok(token)
    }

    fn alloc_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = if self.next_token == usize::MAX - 1 {
                FIRST_CONNECTION_TOKEN
            } else {
                self.next_token + 1
            };
            if !self.connections.contains_key(&token) {
                return token;
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) -> io::Result<()> {
        // The connection may have been closed earlier in this same batch.
        let Some(entry) = self.connections.get_mut(&token) else {
            return Ok(());
        };

        if readable && entry.conn.wants_read() {
            entry.conn.on_readable(&self.cfg.cluster_name)?;
        }
        if writable && !entry.conn.is_closed() {
            entry.conn.on_writable()?;
        }

        let closed = entry.conn.is_closed();
        if closed {
            self.close_connection(token);
            return Ok(());
        }
        self.sync_interest(token)
    }

    /// Bring the poller registration in line with the interest flags the
    /// connection's handlers left behind.
    fn sync_interest(&mut self, token: Token) -> io::Result<()> {
        let entry = match self.connections.get_mut(&token) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        let desired = match (entry.conn.wants_read(), entry.conn.wants_write()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        if desired != entry.registered {
            match desired {
                Some(interest) => {
                    self.poller
                        .update(entry.conn.socket_mut().stream_mut(), token, interest)?;
                }
                None => {
                    self.poller.remove(entry.conn.socket_mut().stream_mut())?;
                }
            }
            entry.registered = desired;
        }
        Ok(())
    }

    /// Remove a connection from the table, dropping its socket (which
    /// releases the descriptor exactly once). Outbound mesh links are
    /// handed back to their peer's dialing state for reconnect.
    fn close_connection(&mut self, token: Token) {
        if let Some(mut entry) = self.connections.remove(&token) {
            debug!("closing connection");
            // The fd may already be invalid if the peer reset hard; a
            // deregistration failure here is not actionable.
            let _ = self.poller.remove(entry.conn.socket_mut().stream_mut());

            if let Some(peer_id) = entry.conn.outbound_peer_id() {
                if let Some(link) = self.peers.iter_mut().find(|l| l.node().id() == peer_id) {
                    link.mark_disconnected(&self.cfg.limits);
                }
            }
        }
    }

    /// Attempt outbound connections for every peer link whose retry delay
    /// has elapsed. Connect completion and failure both surface through
    /// the event loop as readiness on the new stream.
    fn drive_peer_connects(&mut self) {
        let now = Instant::now();
        let due: Vec<usize> = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, link)| link.due(now))
            .map(|(i, _)| i)
            .collect();
        for i in due {
            let node = self.peers[i].node().clone();
            info!("dialing peer {} at {}", node.id(), node.address());
            match node.connect(self.cfg.use_ipv4, self.cfg.use_ipv6) {
                Ok(stream) => {
                    let conn = Connection::new_outbound(
                        stream,
                        node.id(),
                        self.cfg.server_id,
                        &self.cfg.cluster_name,
                    );
                    let interest = Interest::READABLE.add(Interest::WRITABLE);
                    match self.register_connection(conn, interest) {
                        Ok(_) => self.peers[i].mark_connected(),
                        Err(e) => {
                            warn!("problem registering link to peer {}: {}", node.id(), e);
                            self.peers[i].mark_disconnected(&self.cfg.limits);
                        }
                    }
                }
                Err(e) => {
                    warn!("connect to peer {} failed: {}", node.id(), e);
                    self.peers[i].mark_disconnected(&self.cfg.limits);
                }
            }
        }
    }

    /// Close connections that have sat in an unfinished handshake longer
    /// than the configured bound.
    fn sweep_stalled_handshakes(&mut self) {
        let timeout = Duration::from_millis(self.cfg.limits.handshake_timeout_ms);
        let now = Instant::now();
        let stalled: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, e)| {
                !e.conn.handshake_complete() && now.duration_since(e.conn.created()) >= timeout
            })
            .map(|(token, _)| *token)
            .collect();
        for token in stalled {
            warn!("closing connection stalled in handshake");
            self.close_connection(token);
        }
    }

    /// Earliest instant at which a timer-driven action is due: a handshake
    /// deadline or a peer reconnect. `None` means the loop can block
    /// indefinitely.
    fn next_deadline(&self) -> Option<Instant> {
        let timeout = Duration::from_millis(self.cfg.limits.handshake_timeout_ms);
        let handshake = self
            .connections
            .values()
            .filter(|e| !e.conn.handshake_complete())
            .map(|e| e.conn.created() + timeout)
            .min();
        let reconnect = self.peers.iter().filter_map(|l| l.next_attempt()).min();
        match (handshake, reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn drain_and_close(&mut self) {
        info!("shutting down; closing {} connections", self.connections.len());
        for (_, mut entry) in self.connections.drain() {
            let _ = self.poller.remove(entry.conn.socket_mut().stream_mut());
        }
        let _ = self.poller.remove(&mut self.listener);
    }
}
