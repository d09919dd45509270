// Raft wire messages and persisted records
//
// Every type here crosses either the transport port (RPC schemas) or the
// storage port (persistent record, snapshot), so all of them carry serde
// derives and are encoded with bincode at the port boundary.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Raft term number (logical clock of leadership epochs)
pub type Term = u64;

/// Absolute log index
pub type LogIndex = u64;

/// Command replicated through the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set a key to a value
    Set { key: String, value: String },

    /// Delete a key
    Delete { key: String },

    /// Leader barrier entry appended on election; never reaches the state machine
    Noop,

    /// Add a voting member
    AddNode { node_id: NodeId },

    /// Remove a voting member
    RemoveNode { node_id: NodeId },
}

impl Command {
    /// Membership commands mutate the cluster set on replication rather than
    /// being forwarded to the state machine.
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Command::AddNode { .. } | Command::RemoveNode { .. })
    }
}

/// Entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when the entry was received by the leader
    pub term: Term,

    /// Absolute index of this entry
    pub index: LogIndex,

    /// The command to apply
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// Result of a successfully committed and applied command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Index the command was replicated at
    pub index: LogIndex,

    /// Term the command was replicated in
    pub term: Term,

    /// Value returned by the state machine, if any
    pub value: Option<String>,
}

/// Vote request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// Vote response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries request (heartbeat and log replication)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So the follower can redirect clients
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the prev_log_index entry
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower matched prev_log_index/prev_log_term
    pub success: bool,

    /// First index of the conflicting term, for fast backtracking
    pub conflict_index: Option<LogIndex>,

    /// Term of the conflicting local entry, if one exists
    pub conflict_term: Option<Term>,
}

/// InstallSnapshot request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's node ID
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of that entry
    pub last_included_term: Term,

    /// Voting set at the snapshot point
    pub members: Vec<NodeId>,

    /// Serialized state machine
    pub data: Vec<u8>,
}

/// InstallSnapshot response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for the leader to update itself
    pub term: Term,
}

/// State machine snapshot with the log position it covers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last log entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of that entry
    pub last_included_term: Term,

    /// Voting set at the snapshot point
    pub members: Vec<NodeId>,

    /// Serialized state machine state
    pub data: Vec<u8>,
}

/// Durable record handed to the storage port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentRecord {
    /// Latest term this node has seen
    pub current_term: Term,

    /// Candidate that received this node's vote in current_term
    pub voted_for: Option<NodeId>,

    /// Log window above the snapshot base
    pub entries: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_commands_recognized() {
        assert!(Command::AddNode {
            node_id: "node-4".into()
        }
        .is_membership_change());
        assert!(Command::RemoveNode {
            node_id: "node-4".into()
        }
        .is_membership_change());
        assert!(!Command::Noop.is_membership_change());
        assert!(!Command::Set {
            key: "a".into(),
            value: "1".into()
        }
        .is_membership_change());
    }

    #[test]
    fn test_persistent_record_round_trip() {
        let record = PersistentRecord {
            current_term: 7,
            voted_for: Some("node-2".into()),
            entries: vec![LogEntry::new(7, 42, Command::Delete { key: "a".into() })],
        };

        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard()).unwrap();
        let (decoded, _): (PersistentRecord, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();

        assert_eq!(decoded.current_term, 7);
        assert_eq!(decoded.voted_for.as_deref(), Some("node-2"));
        assert_eq!(decoded.entries, record.entries);
    }
}
