// Cluster voting set
//
// The set of voting members, versioned by the log index of the last
// membership command folded into it. Mutations arrive only through
// replicated AddNode/RemoveNode entries: the leader folds a change in when
// it appends the entry, followers when they receive it, and the apply loop
// re-folds idempotently (the version guard makes the second fold a no-op).

use crate::consensus::messages::{Command, LogEntry, LogIndex};
use crate::NodeId;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSet {
    /// Current voting members
    members: BTreeSet<NodeId>,

    /// Log index of the last membership command applied (0 initially)
    version: LogIndex,
}

impl ClusterSet {
    pub fn new(initial: Vec<NodeId>) -> Self {
        Self {
            members: initial.into_iter().collect(),
            version: 0,
        }
    }

    pub fn from_members(members: Vec<NodeId>, version: LogIndex) -> Self {
        Self {
            members: members.into_iter().collect(),
            version,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn version(&self) -> LogIndex {
        self.version
    }

    /// Strict majority of the current voting set.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().cloned().collect()
    }

    /// Every voting member except the given one.
    pub fn others(&self, me: &NodeId) -> Vec<NodeId> {
        self.members.iter().filter(|id| *id != me).cloned().collect()
    }

    /// Fold a membership command in at the given log index. Returns false
    /// when the index was already folded in (idempotent re-application).
    pub fn apply(&mut self, index: LogIndex, command: &Command) -> bool {
        if index <= self.version {
            return false;
        }
        match command {
            Command::AddNode { node_id } => {
                self.members.insert(node_id.clone());
            }
            Command::RemoveNode { node_id } => {
                self.members.remove(node_id);
            }
            _ => return false,
        }
        self.version = index;
        true
    }

    /// Rebuild the set from a base (snapshot membership or the configured
    /// initial peers) plus the membership entries still in the log window.
    /// Used after a follower truncates a tail that held membership entries.
    pub fn rebuild<'a>(
        base: Vec<NodeId>,
        base_version: LogIndex,
        window: impl Iterator<Item = &'a LogEntry>,
    ) -> Self {
        let mut set = Self::from_members(base, base_version);
        for entry in window {
            if entry.command.is_membership_change() {
                set.apply(entry.index, &entry.command);
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> ClusterSet {
        ClusterSet::new(vec!["node-1".into(), "node-2".into(), "node-3".into()])
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(ClusterSet::new(vec!["a".into()]).quorum(), 1);
        assert_eq!(ClusterSet::new(vec!["a".into(), "b".into()]).quorum(), 2);
        assert_eq!(three().quorum(), 2);
        assert_eq!(
            ClusterSet::new(vec!["a".into(), "b".into(), "c".into(), "d".into()]).quorum(),
            3
        );
    }

    #[test]
    fn test_apply_add_and_remove() {
        let mut set = three();
        assert!(set.apply(
            5,
            &Command::AddNode {
                node_id: "node-4".into()
            }
        ));
        assert!(set.contains(&"node-4".to_string()));
        assert_eq!(set.version(), 5);

        assert!(set.apply(
            9,
            &Command::RemoveNode {
                node_id: "node-2".into()
            }
        ));
        assert!(!set.contains(&"node-2".to_string()));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_apply_is_idempotent_by_version() {
        let mut set = three();
        let add = Command::AddNode {
            node_id: "node-4".into(),
        };
        assert!(set.apply(5, &add));
        assert!(!set.apply(5, &add));
        assert!(!set.apply(3, &add));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_non_membership_commands_ignored() {
        let mut set = three();
        assert!(!set.apply(7, &Command::Noop));
        assert_eq!(set.version(), 0);
    }

    #[test]
    fn test_rebuild_from_window() {
        let window = vec![
            LogEntry::new(1, 4, Command::Noop),
            LogEntry::new(
                1,
                5,
                Command::AddNode {
                    node_id: "node-4".into(),
                },
            ),
            LogEntry::new(
                1,
                6,
                Command::RemoveNode {
                    node_id: "node-1".into(),
                },
            ),
        ];
        let set = ClusterSet::rebuild(
            vec!["node-1".into(), "node-2".into(), "node-3".into()],
            3,
            window.iter(),
        );
        assert!(!set.contains(&"node-1".to_string()));
        assert!(set.contains(&"node-4".to_string()));
        assert_eq!(set.version(), 6);
    }

    #[test]
    fn test_others_excludes_self() {
        let set = three();
        let others = set.others(&"node-2".to_string());
        assert_eq!(others.len(), 2);
        assert!(!others.contains(&"node-2".to_string()));
    }
}
