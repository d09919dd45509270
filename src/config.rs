// Raft node configuration
//
// Election timing follows the usual Raft guidance: the election timeout is
// drawn uniformly from [election_timeout_min, election_timeout_max] on every
// reset, and the heartbeat interval must stay well below the minimum so a
// healthy leader never lets a follower time out.

use crate::error::{RaftError, Result};
use crate::NodeId;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration parameters for a single Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID
    pub id: NodeId,

    /// Starting voting set, including this node
    pub initial_peers: Vec<NodeId>,

    /// Minimum election timeout (randomized per reset)
    pub election_timeout_min: Duration,

    /// Maximum election timeout (randomized per reset)
    pub election_timeout_max: Duration,

    /// Heartbeat interval (must be < election_timeout_min / 2)
    pub heartbeat_interval: Duration,

    /// Maximum entries per AppendEntries RPC
    pub max_entries_per_append: usize,

    /// Durable log size (bytes) that triggers a snapshot
    pub snapshot_size_threshold: u64,

    /// Directory for the storage backend; opaque to the consensus core
    pub storage_path: Option<PathBuf>,
}

impl RaftConfig {
    pub fn new(id: impl Into<NodeId>, initial_peers: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            initial_peers,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_size_threshold: 4 * 1024 * 1024,
            storage_path: None,
        }
    }

    /// Check the timing relationships the consensus core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RaftError::InvalidConfig("node id must not be empty".into()));
        }
        if !self.initial_peers.contains(&self.id) {
            return Err(RaftError::InvalidConfig(
                "initial_peers must include this node".into(),
            ));
        }
        if self.election_timeout_max < self.election_timeout_min {
            return Err(RaftError::InvalidConfig(
                "election_timeout_max must be >= election_timeout_min".into(),
            ));
        }
        if self.heartbeat_interval * 2 >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be < election_timeout_min / 2".into(),
            ));
        }
        Ok(())
    }

    /// Draw a fresh randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min..=max);
        Duration::from_millis(timeout_ms)
    }
}
