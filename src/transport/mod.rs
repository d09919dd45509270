// Transport port
//
// Three RPCs, nothing else. Transport failures are opaque to the consensus
// core: a failed send is the same as a lost reply and gets retried on the
// next heartbeat.

pub mod memory;

use crate::consensus::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::error::Result;
use crate::NodeId;
use async_trait::async_trait;

pub use self::memory::{MemoryNetwork, MemoryTransport};

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
