// Durable storage port
//
// Contract to the write-ahead backend: the consensus core saves the full
// persistent record (term, vote, log window) before any response that
// depends on it leaves the node, and snapshots on compaction. MemoryStorage
// backs unit and cluster tests; FileStorage is the bincode-on-disk backend.

pub mod file;

use crate::consensus::messages::{PersistentRecord, Snapshot};
use crate::error::{RaftError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

pub use self::file::FileStorage;

#[async_trait]
pub trait RaftStorage: Send + Sync {
    /// Persist the record; must be durable before returning.
    async fn save(&self, record: &PersistentRecord) -> Result<()>;

    /// Load the last saved record, if any.
    async fn load(&self) -> Result<Option<PersistentRecord>>;

    /// Persist a snapshot.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load the last saved snapshot, if any.
    async fn load_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Size in bytes of the durable log record; drives snapshot triggering.
    async fn size(&self) -> Result<u64>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryStorage {
    record: RwLock<Option<PersistentRecord>>,
    snapshot: RwLock<Option<Snapshot>>,
    record_size: RwLock<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RaftStorage for MemoryStorage {
    async fn save(&self, record: &PersistentRecord) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        *self.record_size.write() = bytes.len() as u64;
        *self.record.write() = Some(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistentRecord>> {
        Ok(self.record.read().clone())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().clone())
    }

    async fn size(&self) -> Result<u64> {
        Ok(*self.record_size.read())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
