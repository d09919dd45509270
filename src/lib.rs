// RustyRaft - Raft consensus engine
// Core library module

pub mod config;
pub mod consensus;
pub mod error;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use consensus::messages::{
    Command, CommandOutcome, LogEntry, LogIndex, PersistentRecord, Snapshot, Term,
};
pub use consensus::{RaftNode, RaftRole, RaftStatus};
pub use error::{RaftError, Result};
pub use state_machine::{KvStateMachine, StateMachine};
pub use storage::{FileStorage, MemoryStorage, RaftStorage};
pub use transport::{MemoryNetwork, MemoryTransport, RaftTransport};

/// Stable node identifier, unique within a cluster
pub type NodeId = String;
