// File-backed storage
//
// Single-directory backend: one bincode file for the persistent record, one
// for the snapshot. Writes go through a temp file and rename so a crash
// mid-save leaves the previous record intact.

use crate::consensus::messages::{PersistentRecord, Snapshot};
use crate::error::{RaftError, Result};
use crate::storage::RaftStorage;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "raft_state.bin";
const SNAPSHOT_FILE: &str = "raft_snapshot.bin";

pub struct FileStorage {
    record_path: PathBuf,
    snapshot_path: PathBuf,
}

impl FileStorage {
    /// Open the backend under the configured storage path.
    pub fn from_config(config: &crate::config::RaftConfig) -> Result<Self> {
        let dir = config.storage_path.clone().ok_or_else(|| {
            RaftError::InvalidConfig("storage_path is not set".into())
        })?;
        Self::new(dir)
    }

    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            record_path: dir.join(RECORD_FILE),
            snapshot_path: dir.join(SNAPSHOT_FILE),
        })
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RaftStorage for FileStorage {
    async fn save(&self, record: &PersistentRecord) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.record_path, &bytes).await
    }

    async fn load(&self) -> Result<Option<PersistentRecord>> {
        match Self::read_optional(&self.record_path).await? {
            Some(bytes) => {
                let (record, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| RaftError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        Self::write_atomic(&self.snapshot_path, &bytes).await
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match Self::read_optional(&self.snapshot_path).await? {
            Some(bytes) => {
                let (snapshot, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| RaftError::Serialization(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn size(&self) -> Result<u64> {
        match tokio::fs::metadata(&self.record_path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::messages::{Command, LogEntry};

    #[test]
    fn test_from_config_requires_storage_path() {
        let mut config = crate::config::RaftConfig::new("node-1", vec!["node-1".into()]);
        assert!(FileStorage::from_config(&config).is_err());

        let dir = tempfile::tempdir().unwrap();
        config.storage_path = Some(dir.path().to_path_buf());
        assert!(FileStorage::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(storage.load().await.unwrap().is_none());
        assert_eq!(storage.size().await.unwrap(), 0);

        let record = PersistentRecord {
            current_term: 4,
            voted_for: None,
            entries: vec![LogEntry::new(4, 1, Command::Noop)],
        };
        storage.save(&record).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.current_term, 4);
        assert_eq!(loaded.entries.len(), 1);
        assert!(storage.size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save(&PersistentRecord {
                    current_term: 9,
                    voted_for: Some("node-3".into()),
                    entries: Vec::new(),
                })
                .await
                .unwrap();
            storage
                .save_snapshot(&Snapshot {
                    last_included_index: 5,
                    last_included_term: 2,
                    members: vec!["node-1".into()],
                    data: vec![7; 16],
                })
                .await
                .unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        let record = storage.load().await.unwrap().unwrap();
        assert_eq!(record.current_term, 9);
        assert_eq!(record.voted_for.as_deref(), Some("node-3"));

        let snapshot = storage.load_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.last_included_index, 5);
        assert_eq!(snapshot.data.len(), 16);
    }
}
