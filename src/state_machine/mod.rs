// State machine port
//
// The consensus core drives the state machine through a narrow apply/get/
// snapshot/restore interface. KvStateMachine is the in-memory key/value
// store the crate ships; anything deterministic fits behind the trait.

use crate::consensus::messages::Command;
use crate::error::{RaftError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed command and return its result value, if any.
    /// Called exactly once per index, in ascending index order.
    async fn apply(&self, command: &Command) -> Option<String>;

    /// Read a key without going through the log.
    async fn get(&self, key: &str) -> Option<String>;

    /// Export the full state for a snapshot.
    async fn export_snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the full state from a snapshot.
    async fn restore_snapshot(&self, data: &[u8]) -> Result<()>;
}

/// In-memory key/value state machine
#[derive(Default)]
pub struct KvStateMachine {
    data: RwLock<HashMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&self, command: &Command) -> Option<String> {
        match command {
            Command::Set { key, value } => {
                self.data.write().insert(key.clone(), value.clone());
                Some(value.clone())
            }
            Command::Delete { key } => self.data.write().remove(key),
            // Noop and membership changes never reach the state machine
            _ => None,
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    async fn export_snapshot(&self) -> Result<Vec<u8>> {
        let data = self.data.read().clone();
        bincode::serde::encode_to_vec(&data, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }

    async fn restore_snapshot(&self, data: &[u8]) -> Result<()> {
        let (map, _): (HashMap<String, String>, _) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| RaftError::Serialization(e.to_string()))?;
        *self.data.write() = map;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let sm = KvStateMachine::new();

        let value = sm
            .apply(&Command::Set {
                key: "a".into(),
                value: "1".into(),
            })
            .await;
        assert_eq!(value.as_deref(), Some("1"));
        assert_eq!(sm.get("a").await.as_deref(), Some("1"));

        let removed = sm.apply(&Command::Delete { key: "a".into() }).await;
        assert_eq!(removed.as_deref(), Some("1"));
        assert!(sm.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_noop_does_not_touch_state() {
        let sm = KvStateMachine::new();
        assert!(sm.apply(&Command::Noop).await.is_none());
        assert!(sm.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_export_restore() {
        let sm = KvStateMachine::new();
        for i in 0..10 {
            sm.apply(&Command::Set {
                key: format!("k{}", i),
                value: format!("v{}", i),
            })
            .await;
        }

        let bytes = sm.export_snapshot().await.unwrap();

        let restored = KvStateMachine::new();
        restored.restore_snapshot(&bytes).await.unwrap();
        assert_eq!(restored.len(), 10);
        assert_eq!(restored.get("k7").await.as_deref(), Some("v7"));
    }

    #[tokio::test]
    async fn test_restore_replaces_existing_state() {
        let sm = KvStateMachine::new();
        sm.apply(&Command::Set {
            key: "stale".into(),
            value: "x".into(),
        })
        .await;

        let other = KvStateMachine::new();
        other
            .apply(&Command::Set {
                key: "fresh".into(),
                value: "y".into(),
            })
            .await;
        let bytes = other.export_snapshot().await.unwrap();

        sm.restore_snapshot(&bytes).await.unwrap();
        assert!(sm.get("stale").await.is_none());
        assert_eq!(sm.get("fresh").await.as_deref(), Some("y"));
    }
}
