// Pending command registry
//
// One oneshot slot per log index the leader has appended but not yet
// applied. The apply loop resolves slots with the state machine's return
// value; a role change fails everything with NotLeader; shutdown fails
// everything with Shutdown. Deadline expiry removes the slot on the
// submitter's side so nothing leaks.

use crate::consensus::messages::{CommandOutcome, LogIndex, Term};
use crate::error::{RaftError, Result};
use std::collections::HashMap;
use tokio::sync::oneshot;

struct PendingSlot {
    /// Term the entry was appended in; a resolved entry with a different
    /// term means the slot's command was overwritten by another leader.
    term: Term,
    tx: oneshot::Sender<Result<CommandOutcome>>,
}

#[derive(Default)]
pub(crate) struct PendingRegistry {
    slots: HashMap<LogIndex, PendingSlot>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Register a slot for a freshly appended entry.
    pub fn register(&mut self, index: LogIndex, term: Term) -> oneshot::Receiver<Result<CommandOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(index, PendingSlot { term, tx });
        rx
    }

    /// Resolve the slot at an applied index. If the applied entry's term
    /// differs from the registered one, the original command was lost to a
    /// competing leader and the waiter gets NotLeader.
    pub fn resolve(&mut self, index: LogIndex, applied_term: Term, value: Option<String>) {
        if let Some(slot) = self.slots.remove(&index) {
            let result = if slot.term == applied_term {
                Ok(CommandOutcome {
                    index,
                    term: applied_term,
                    value,
                })
            } else {
                Err(RaftError::NotLeader { leader_id: None })
            };
            let _ = slot.tx.send(result);
        }
    }

    /// Drop the slot at an index without resolving it (deadline expiry).
    pub fn remove(&mut self, index: LogIndex) {
        self.slots.remove(&index);
    }

    /// Fail every outstanding slot, e.g. on step-down or shutdown.
    pub fn fail_all(&mut self, error: impl Fn() -> RaftError) {
        for (_, slot) in self.slots.drain() {
            let _ = slot.tx.send(Err(error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_matching_term() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(3, 2);
        registry.resolve(3, 2, Some("v".into()));

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.index, 3);
        assert_eq!(outcome.term, 2);
        assert_eq!(outcome.value.as_deref(), Some("v"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_resolve_term_mismatch_is_not_leader() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(3, 2);
        registry.resolve(3, 5, None);

        assert!(matches!(
            rx.await.unwrap(),
            Err(RaftError::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut registry = PendingRegistry::new();
        let rx1 = registry.register(1, 1);
        let rx2 = registry.register(2, 1);
        registry.fail_all(|| RaftError::Shutdown);

        assert!(matches!(rx1.await.unwrap(), Err(RaftError::Shutdown)));
        assert!(matches!(rx2.await.unwrap(), Err(RaftError::Shutdown)));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_remove_drops_sender() {
        let mut registry = PendingRegistry::new();
        let rx = registry.register(1, 1);
        registry.remove(1);
        assert!(rx.await.is_err());
    }
}
