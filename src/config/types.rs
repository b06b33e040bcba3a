//! Configuration type definitions.

use std::collections::HashMap;

use serde::Deserialize;

/// Tunables for the network engine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Connections that have not completed a handshake within this bound
    /// are closed by the idle sweep.
    pub handshake_timeout_ms: u64,
    /// Maximum accepted connections per listener wakeup, so a busy accept
    /// queue cannot starve other ready descriptors.
    pub accept_batch: usize,
    /// Initial delay before retrying a failed peer link.
    pub reconnect_base_ms: u64,
    /// Upper bound on the peer-link retry delay.
    pub reconnect_max_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            accept_batch: 64,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Root configuration, loaded from a YAML file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Operator-chosen name all nodes of one cluster must agree on.
    pub cluster_name: String,
    /// This node's id. Must have an entry in `hosts`.
    pub server_id: u32,
    /// Address the listening socket binds to.
    pub bind_address: String,
    /// Peer id to address map for the full cluster, this node included.
    pub hosts: HashMap<u32, String>,
    /// Directory handed to the storage engine.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub use_ipv4: bool,
    #[serde(default)]
    pub use_ipv6: bool,
    #[serde(default)]
    pub limits: Limits,
}

fn default_data_dir() -> String {
    "data".into()
}

fn default_true() -> bool {
    true
}
