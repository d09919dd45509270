// In-process transport
//
// Routes RPCs between RaftNode instances registered on a shared network,
// with link-level partition injection. This is the backbone of the cluster
// test harness; a production transport implements the same trait over real
// sockets.

use crate::consensus::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::consensus::RaftNode;
use crate::error::{RaftError, Result};
use crate::transport::RaftTransport;
use crate::NodeId;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// Shared routing table for a simulated cluster
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<NodeId, Arc<RaftNode>>,
    blocked: DashSet<(NodeId, NodeId)>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes.insert(node.id().clone(), node);
    }

    pub fn deregister(&self, id: &NodeId) {
        self.nodes.remove(id);
    }

    /// Sever the link between two nodes, both directions.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.blocked.insert((a.clone(), b.clone()));
        self.blocked.insert((b.clone(), a.clone()));
    }

    /// Restore the link between two nodes.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.blocked.remove(&(a.clone(), b.clone()));
        self.blocked.remove(&(b.clone(), a.clone()));
    }

    /// Cut a node off from every currently registered peer.
    pub fn isolate(&self, id: &NodeId) {
        for entry in self.nodes.iter() {
            if entry.key() != id {
                self.partition(id, entry.key());
            }
        }
    }

    /// Reconnect a node to every currently registered peer.
    pub fn rejoin(&self, id: &NodeId) {
        for entry in self.nodes.iter() {
            if entry.key() != id {
                self.heal(id, entry.key());
            }
        }
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<Arc<RaftNode>> {
        if self.blocked.contains(&(from.clone(), to.clone())) {
            return Err(RaftError::Transport(format!(
                "link {} -> {} is partitioned",
                from, to
            )));
        }
        self.nodes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RaftError::Transport(format!("node {} is unreachable", to)))
    }
}

/// Per-node handle onto a MemoryNetwork
pub struct MemoryTransport {
    origin: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(origin: impl Into<NodeId>, network: Arc<MemoryNetwork>) -> Self {
        Self {
            origin: origin.into(),
            network,
        }
    }
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.route(&self.origin, target)?;
        node.handle_request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(&self.origin, target)?;
        node.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.network.route(&self.origin, target)?;
        node.handle_install_snapshot(request).await
    }
}
