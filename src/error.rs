use crate::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("operation timed out")]
    Timeout,

    #[error("a configuration change is already in flight")]
    ConfigChangePending,

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node already exists: {0}")]
    NodeAlreadyExists(NodeId),

    #[error("cannot remove the last cluster member")]
    CannotRemoveLastNode,

    #[error("log index {0} falls below the snapshot base")]
    LogCompacted(u64),

    #[error("log append out of order: expected index {expected}, got {got}")]
    InvalidAppend { expected: u64, got: u64 },

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("node is shutting down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
