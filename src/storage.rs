//! Storage engine boundary.
//!
//! The network engine consults storage only through this narrow interface.
//! `deliver` is the hook the replication layer will call once a quorum of
//! cluster nodes has acknowledged a write; it must stay cheap, with real
//! work done by the storage engine's own threads.

use std::fs;
use std::io;
use std::path::PathBuf;

use log::*;

pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Prepare the data directory and open the store.
    pub fn open(data_dir: &str) -> io::Result<Storage> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir)?;
        info!("storage opened at {}", data_dir.display());
        Ok(Storage { data_dir })
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// Apply the log entry at `offset` once the cluster has committed it.
    pub fn deliver(&self, offset: u64) {
        // Wired up when the replication layer lands.
        debug!("deliver called for offset {}", offset);
    }
}
