//! Network engine for the veles server.
//!
//! This module contains:
//! - `poller`: Readiness event loop wrapper (epoll/kqueue via mio)
//! - `socket`: Non-blocking buffered socket with partial-I/O accounting
//! - `connection`: Per-peer handshake state machine
//! - `server`: Accept and dispatch loop
//! - `cluster`: Peer topology and self-healing outbound links

pub mod cluster;
pub mod connection;
pub mod poller;
pub mod server;
pub mod socket;

// Re-export the main entry points
pub use server::{Server, ShutdownHandle};
