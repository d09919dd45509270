// Raft consensus node
//
// The node owns its storage, state machine, and transport handles, and keeps
// every Raft-safety field (term, vote, log, commit/applied indices, role,
// membership, replication tables, pending slots) in one state block behind a
// single lock. Driver loops: a randomized election timer, a heartbeat/
// replication loop, and the apply loop that feeds the state machine and
// resolves pending client commands. Network sends never hold the lock.

pub mod election;
pub mod log;
pub mod membership;
pub mod messages;
pub mod pending;
pub mod replication;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::state_machine::StateMachine;
use crate::storage::RaftStorage;
use crate::transport::RaftTransport;
use crate::NodeId;
use self::election::ElectionManager;
use self::log::RaftLog;
use self::membership::ClusterSet;
use self::messages::{
    AppendEntriesRequest, AppendEntriesResponse, Command, CommandOutcome, InstallSnapshotRequest,
    InstallSnapshotResponse, LogEntry, LogIndex, PersistentRecord, Snapshot, Term, VoteRequest,
    VoteResponse,
};
use self::pending::PendingRegistry;
use self::replication::ReplicationManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify, RwLock};
use tokio::task::JoinHandle;

/// Raft role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Passively replicates entries from the leader
    Follower,

    /// Requesting votes for leadership
    Candidate,

    /// Serves clients and drives replication
    Leader,
}

/// Point-in-time view of a node, for operators and tests
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub members: Vec<NodeId>,
    pub config_change_pending: bool,
}

/// Every field that participates in Raft safety, guarded by one lock.
pub(crate) struct RaftState {
    pub(crate) role: RaftRole,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) log: RaftLog,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) members: ClusterSet,
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,
    pub(crate) votes_received: HashMap<NodeId, bool>,
    pub(crate) pending: PendingRegistry,
    pub(crate) pending_config: Option<LogIndex>,
    pub(crate) pending_restore: Option<Snapshot>,
    pub(crate) snapshot_in_progress: bool,
}

/// Shared core of a node; the managers and driver loops all hold an Arc.
pub(crate) struct NodeInner {
    pub(crate) node_id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) state: RwLock<RaftState>,
    pub(crate) storage: Arc<dyn RaftStorage>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) apply_notify: Notify,
    pub(crate) replicate_notify: Notify,
    pub(crate) election_reset: Notify,
    pub(crate) applied_tx: watch::Sender<LogIndex>,
    pub(crate) applied_rx: watch::Receiver<LogIndex>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl NodeInner {
    /// Write the durable record. Callers hold the state lock, so the save
    /// lands before any response that depends on the mutation is released.
    pub(crate) async fn persist(&self, state: &RaftState) -> Result<()> {
        let record = PersistentRecord {
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
            entries: state.log.window(),
        };
        self.storage.save(&record).await
    }

    /// Revert to follower, adopting the given term if it is newer. The
    /// caller persists when the term moved and sets leader_id as it sees fit.
    pub(crate) fn step_down(&self, state: &mut RaftState, term: Term) {
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
        }
        if state.role != RaftRole::Follower {
            tracing::info!(
                node_id = %self.node_id,
                term = state.current_term,
                "stepping down to follower"
            );
        }
        state.role = RaftRole::Follower;
        state.votes_received.clear();
        state.pending_config = None;
        state.pending.fail_all(|| RaftError::NotLeader { leader_id: None });
    }

    /// A reply carried a newer term than ours; step down and persist it.
    pub(crate) async fn observe_higher_term(&self, term: Term) {
        let mut state = self.state.write().await;
        if term > state.current_term {
            self.step_down(&mut state, term);
            state.leader_id = None;
            if let Err(e) = self.persist(&state).await {
                tracing::error!(node_id = %self.node_id, error = %e, "failed to persist term update");
            }
        }
    }

    /// Apply loop: the only task that touches the state machine. Drains
    /// committed entries in ascending index order, folds membership changes
    /// into the cluster set, resolves pending slots, and services snapshot
    /// restores handed over by InstallSnapshot.
    async fn apply_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            loop {
                let restore = self.state.write().await.pending_restore.take();
                if let Some(snapshot) = restore {
                    match self.state_machine.restore_snapshot(&snapshot.data).await {
                        Ok(()) => {
                            let mut state = self.state.write().await;
                            if snapshot.last_included_index > state.last_applied {
                                state.last_applied = snapshot.last_included_index;
                            }
                            self.applied_tx.send_replace(state.last_applied);
                            tracing::info!(
                                node_id = %self.node_id,
                                last_applied = state.last_applied,
                                "state machine restored from snapshot"
                            );
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(
                                node_id = %self.node_id,
                                error = %e,
                                "state machine restore failed"
                            );
                            break;
                        }
                    }
                }

                let next = {
                    let state = self.state.read().await;
                    if state.last_applied >= state.commit_index {
                        None
                    } else {
                        state.log.entry_at(state.last_applied + 1).cloned()
                    }
                };
                let Some(entry) = next else { break };

                if entry.command.is_membership_change() {
                    let mut state = self.state.write().await;
                    // the set was already mutated on append/receipt; the
                    // version guard makes this fold idempotent
                    state.members.apply(entry.index, &entry.command);
                    if state.pending_config == Some(entry.index) {
                        state.pending_config = None;
                    }
                    self.finish_apply(&mut state, &entry, None);
                    if let Command::RemoveNode { node_id } = &entry.command {
                        if node_id == &self.node_id && state.role == RaftRole::Leader {
                            tracing::info!(
                                node_id = %self.node_id,
                                "own removal committed, stepping down"
                            );
                            let term = state.current_term;
                            self.step_down(&mut state, term);
                            state.leader_id = None;
                        }
                    }
                } else if matches!(entry.command, Command::Noop) {
                    let mut state = self.state.write().await;
                    self.finish_apply(&mut state, &entry, None);
                } else {
                    let value = self.state_machine.apply(&entry.command).await;
                    let mut state = self.state.write().await;
                    self.finish_apply(&mut state, &entry, value);
                }
            }

            self.maybe_snapshot().await;

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.apply_notify.notified() => {}
            }
        }
    }

    fn finish_apply(&self, state: &mut RaftState, entry: &LogEntry, value: Option<String>) {
        if entry.index > state.last_applied {
            state.last_applied = entry.index;
        }
        self.applied_tx.send_replace(state.last_applied);
        state.pending.resolve(entry.index, entry.term, value);
    }

    /// Snapshot at last_applied once the durable log outgrows the threshold.
    /// Runs on the apply task, so the exported state is exactly the applied
    /// prefix.
    async fn maybe_snapshot(self: &Arc<Self>) {
        let size = match self.storage.size().await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "storage size query failed");
                return;
            }
        };
        if size <= self.config.snapshot_size_threshold {
            return;
        }

        let (index, term, members) = {
            let mut state = self.state.write().await;
            if state.snapshot_in_progress || state.last_applied <= state.log.base_index() {
                return;
            }
            let index = state.last_applied;
            let Some(term) = state.log.term_at(index) else {
                return;
            };
            state.snapshot_in_progress = true;
            (index, term, state.members.ids())
        };

        tracing::info!(node_id = %self.node_id, index, "creating snapshot");
        let built = async {
            let data = self.state_machine.export_snapshot().await?;
            let snapshot = Snapshot {
                last_included_index: index,
                last_included_term: term,
                members,
                data,
            };
            self.storage
                .save_snapshot(&snapshot)
                .await
                .map_err(|e| RaftError::SnapshotFailed(e.to_string()))?;
            Ok::<Snapshot, RaftError>(snapshot)
        }
        .await;

        let mut state = self.state.write().await;
        state.snapshot_in_progress = false;
        match built {
            Ok(snapshot) => {
                if snapshot.last_included_index > state.log.base_index() {
                    state.log.compact_through(snapshot);
                    if let Err(e) = self.persist(&state).await {
                        tracing::error!(
                            node_id = %self.node_id,
                            error = %e,
                            "failed to persist compacted log"
                        );
                    }
                    tracing::info!(
                        node_id = %self.node_id,
                        base_index = state.log.base_index(),
                        "log compacted"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(node_id = %self.node_id, error = %e, "snapshot failed");
            }
        }
    }
}

/// A single Raft consensus node
pub struct RaftNode {
    inner: Arc<NodeInner>,
    election: ElectionManager,
    replication: ReplicationManager,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("node_id", &self.inner.node_id)
            .finish_non_exhaustive()
    }
}

impl RaftNode {
    /// Build a node, recovering term, vote, log window, and state machine
    /// from the storage port.
    pub async fn new(
        config: RaftConfig,
        storage: Arc<dyn RaftStorage>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let mut log = RaftLog::new();
        let mut members = ClusterSet::new(config.initial_peers.clone());
        let mut current_term = 0;
        let mut voted_for = None;
        let mut commit_index = 0;
        let mut last_applied = 0;

        if let Some(snapshot) = storage.load_snapshot().await? {
            members =
                ClusterSet::from_members(snapshot.members.clone(), snapshot.last_included_index);
            commit_index = snapshot.last_included_index;
            last_applied = snapshot.last_included_index;
            state_machine.restore_snapshot(&snapshot.data).await?;
            log.install_snapshot(snapshot);
        }

        if let Some(record) = storage.load().await? {
            current_term = record.current_term;
            voted_for = record.voted_for;
            for entry in record.entries {
                if entry.index <= log.base_index() {
                    continue;
                }
                if entry.command.is_membership_change() {
                    members.apply(entry.index, &entry.command);
                }
                log.append(entry)?;
            }
        }

        tracing::info!(
            node_id = %config.id,
            term = current_term,
            last_log_index = log.last_index(),
            snapshot_index = log.base_index(),
            "node recovered from storage"
        );

        let state = RaftState {
            role: RaftRole::Follower,
            current_term,
            voted_for,
            leader_id: None,
            log,
            commit_index,
            last_applied,
            members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashMap::new(),
            pending: PendingRegistry::new(),
            pending_config: None,
            pending_restore: None,
            snapshot_in_progress: false,
        };

        let (applied_tx, applied_rx) = watch::channel(last_applied);
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            node_id: config.id.clone(),
            config,
            state: RwLock::new(state),
            storage,
            state_machine,
            transport,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            election_reset: Notify::new(),
            applied_tx,
            applied_rx,
            shutdown_tx,
        });

        Ok(Self {
            election: ElectionManager::new(inner.clone()),
            replication: ReplicationManager::new(inner.clone()),
            inner,
            tasks: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Spawn the election timer, heartbeat loop, and apply loop.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RaftError::InvalidConfig("node already started".into()));
        }
        let mut tasks = self.tasks.lock();
        let election = self.election.clone();
        tasks.push(tokio::spawn(election.run()));
        let replication = self.replication.clone();
        tasks.push(tokio::spawn(replication.run()));
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(inner.apply_loop()));
        tracing::info!(node_id = %self.inner.node_id, "raft node started");
        Ok(())
    }

    /// Stop the driver loops, fail pending calls, and close storage.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        {
            let mut state = self.inner.state.write().await;
            state.pending.fail_all(|| RaftError::Shutdown);
        }
        if let Err(e) = self.inner.storage.close().await {
            tracing::warn!(node_id = %self.inner.node_id, error = %e, "storage close failed");
        }
        tracing::info!(node_id = %self.inner.node_id, "raft node stopped");
    }

    /// Replicate a command and wait until it is applied. Leader only.
    pub async fn submit(&self, command: Command, deadline: Duration) -> Result<CommandOutcome> {
        if command.is_membership_change() {
            return Err(RaftError::InvalidConfig(
                "membership changes go through add_node/remove_node".into(),
            ));
        }

        let (index, rx) = {
            let mut state = self.inner.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            let index = state.log.last_index() + 1;
            let term = state.current_term;
            state.log.append(LogEntry::new(term, index, command))?;
            self.inner.persist(&state).await?;
            // a single-node cluster commits on its own append
            if replication::advance_commit_index(&self.inner.node_id, &mut state) {
                self.inner.apply_notify.notify_one();
            }
            (index, state.pending.register(index, term))
        };

        self.inner.replicate_notify.notify_one();
        self.await_outcome(index, rx, deadline).await
    }

    /// Linearizable read: quorum leadership confirmation, then wait for the
    /// applied index to catch the commit index captured at entry.
    pub async fn read(&self, key: &str, deadline: Duration) -> Result<Option<String>> {
        let started = tokio::time::Instant::now();
        let (read_index, term) = {
            let state = self.inner.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            (state.commit_index, state.current_term)
        };

        let window = deadline.min(self.inner.config.election_timeout_min);
        self.replication.confirm_leadership(term, window).await?;

        let remaining = deadline.saturating_sub(started.elapsed());
        let mut applied = self.inner.applied_rx.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(remaining, applied.wait_for(|v| *v >= read_index)) => {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => return Err(RaftError::Shutdown),
                    Err(_) => return Err(RaftError::Timeout),
                }
            }
            _ = shutdown.changed() => return Err(RaftError::Shutdown),
        }

        Ok(self.inner.state_machine.get(key).await)
    }

    /// Add a voting member. One reconfiguration may be in flight at a time.
    pub async fn add_node(&self, node_id: impl Into<NodeId>, deadline: Duration) -> Result<()> {
        let node_id = node_id.into();
        let (index, rx) = {
            let mut state = self.inner.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            if state.pending_config.is_some() {
                return Err(RaftError::ConfigChangePending);
            }
            if state.members.contains(&node_id) {
                return Err(RaftError::NodeAlreadyExists(node_id));
            }

            let index = state.log.last_index() + 1;
            let term = state.current_term;
            let command = Command::AddNode {
                node_id: node_id.clone(),
            };
            state.log.append(LogEntry::new(term, index, command.clone()))?;
            // adopt the change on append so replication reaches the new peer
            state.members.apply(index, &command);
            state.next_index.insert(node_id.clone(), index + 1);
            state.match_index.insert(node_id.clone(), 0);
            state.pending_config = Some(index);
            self.inner.persist(&state).await?;
            (index, state.pending.register(index, term))
        };

        tracing::info!(node_id = %self.inner.node_id, added = %node_id, index, "adding cluster member");
        self.inner.replicate_notify.notify_one();
        self.await_outcome(index, rx, deadline).await.map(|_| ())
    }

    /// Remove a voting member; removing this node itself is allowed only
    /// when other members remain, and the leader steps down once the
    /// removal commits.
    pub async fn remove_node(&self, node_id: impl Into<NodeId>, deadline: Duration) -> Result<()> {
        let node_id = node_id.into();
        let (index, rx) = {
            let mut state = self.inner.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            if state.pending_config.is_some() {
                return Err(RaftError::ConfigChangePending);
            }
            if !state.members.contains(&node_id) {
                return Err(RaftError::NodeNotFound(node_id));
            }
            if state.members.len() <= 1 {
                return Err(RaftError::CannotRemoveLastNode);
            }

            let index = state.log.last_index() + 1;
            let term = state.current_term;
            let command = Command::RemoveNode {
                node_id: node_id.clone(),
            };
            state.log.append(LogEntry::new(term, index, command.clone()))?;
            state.members.apply(index, &command);
            state.next_index.remove(&node_id);
            state.match_index.remove(&node_id);
            state.pending_config = Some(index);
            self.inner.persist(&state).await?;
            // the quorum shrank; the entry may already be replicated widely
            if replication::advance_commit_index(&self.inner.node_id, &mut state) {
                self.inner.apply_notify.notify_one();
            }
            (index, state.pending.register(index, term))
        };

        tracing::info!(node_id = %self.inner.node_id, removed = %node_id, index, "removing cluster member");
        self.inner.replicate_notify.notify_one();
        self.await_outcome(index, rx, deadline).await.map(|_| ())
    }

    async fn await_outcome(
        &self,
        index: LogIndex,
        rx: oneshot::Receiver<Result<CommandOutcome>>,
        deadline: Duration,
    ) -> Result<CommandOutcome> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                // deadline expired; reclaim the slot so nothing leaks
                let mut state = self.inner.state.write().await;
                state.pending.remove(index);
                Err(RaftError::Timeout)
            }
        }
    }

    // RPC handlers, invoked by the transport layer.

    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.election.handle_request_vote(request).await
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.replication.handle_append_entries(request).await
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.replication.handle_install_snapshot(request).await
    }

    // Introspection.

    pub async fn role(&self) -> RaftRole {
        self.inner.state.read().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.state.read().await.role == RaftRole::Leader
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.inner.state.read().await.leader_id.clone()
    }

    pub async fn current_term(&self) -> Term {
        self.inner.state.read().await.current_term
    }

    pub async fn status(&self) -> RaftStatus {
        let state = self.inner.state.read().await;
        RaftStatus {
            node_id: self.inner.node_id.clone(),
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.log.last_index(),
            snapshot_index: state.log.base_index(),
            members: state.members.ids(),
            config_change_pending: state.pending_config.is_some(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::KvStateMachine;
    use crate::storage::MemoryStorage;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use super::test_support::test_node;

    fn set(key: &str, value: &str) -> Command {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    async fn wait_leader(node: &RaftNode) {
        for _ in 0..100 {
            if node.is_leader().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test]
    async fn test_submit_rejected_on_follower() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        let err = node
            .submit(set("a", "1"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_membership_command_rejected_from_submit() {
        let node = test_node("node-1", &["node-1"]).await;
        let err = node
            .submit(
                Command::AddNode {
                    node_id: "node-2".into(),
                },
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_single_node_submit_and_read() {
        let node = test_node("node-1", &["node-1"]).await;
        node.start().unwrap();
        wait_leader(&node).await;

        let outcome = node
            .submit(set("a", "1"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome.value.as_deref(), Some("1"));
        assert!(outcome.index >= 2); // the leader barrier sits below it

        let value = node.read("a", Duration::from_secs(2)).await.unwrap();
        assert_eq!(value.as_deref(), Some("1"));

        let absent = node.read("missing", Duration::from_secs(2)).await.unwrap();
        assert!(absent.is_none());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let node = test_node("node-1", &["node-1"]).await;
        node.start().unwrap();
        wait_leader(&node).await;
        node.submit(set("a", "1"), Duration::from_secs(2))
            .await
            .unwrap();

        let status = node.status().await;
        assert_eq!(status.node_id, "node-1");
        assert_eq!(status.role, RaftRole::Leader);
        assert_eq!(status.leader_id.as_deref(), Some("node-1"));
        assert_eq!(status.commit_index, status.last_applied);
        assert_eq!(status.members, vec!["node-1".to_string()]);
        assert!(!status.config_change_pending);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_recovers_persistent_state() {
        let storage = Arc::new(MemoryStorage::new());
        let network = MemoryNetwork::new();
        let mut config = RaftConfig::new("node-1", vec!["node-1".into()]);
        config.election_timeout_min = Duration::from_millis(100);
        config.election_timeout_max = Duration::from_millis(250);
        config.heartbeat_interval = Duration::from_millis(30);

        let term_before = {
            let node = RaftNode::new(
                config.clone(),
                storage.clone(),
                Arc::new(KvStateMachine::new()),
                Arc::new(MemoryTransport::new("node-1", network.clone())),
            )
            .await
            .unwrap();
            node.start().unwrap();
            wait_leader(&node).await;
            node.submit(set("a", "1"), Duration::from_secs(2))
                .await
                .unwrap();
            node.submit(set("b", "2"), Duration::from_secs(2))
                .await
                .unwrap();
            let term = node.current_term().await;
            node.shutdown().await;
            term
        };

        // a fresh node over the same storage sees the same term and log,
        // and re-applies the committed entries after re-election
        let node = RaftNode::new(
            config,
            storage,
            Arc::new(KvStateMachine::new()),
            Arc::new(MemoryTransport::new("node-1", network)),
        )
        .await
        .unwrap();
        assert_eq!(node.current_term().await, term_before);
        assert_eq!(node.status().await.last_log_index, 3);

        node.start().unwrap();
        wait_leader(&node).await;
        let value = node.read("b", Duration::from_secs(2)).await.unwrap();
        assert_eq!(value.as_deref(), Some("2"));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_submissions() {
        let node = Arc::new(test_node("node-1", &["node-1", "node-2", "node-3"]).await);
        {
            // fake leadership so the submission is accepted but never commits
            let mut state = node.inner.state.write().await;
            state.role = RaftRole::Leader;
            state.current_term = 1;
        }

        let submitter = {
            let node = node.clone();
            tokio::spawn(async move { node.submit(set("a", "1"), Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.shutdown().await;

        let result = submitter.await.unwrap();
        assert!(matches!(result, Err(RaftError::Shutdown)));
    }

    #[tokio::test]
    async fn test_add_node_preconditions() {
        let node = test_node("node-1", &["node-1"]).await;
        node.start().unwrap();
        wait_leader(&node).await;

        let err = node
            .add_node("node-1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NodeAlreadyExists(_)));

        let err = node
            .remove_node("node-9", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NodeNotFound(_)));

        let err = node
            .remove_node("node-1", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::CannotRemoveLastNode));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_change_pending_blocks_second_change() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        {
            let mut state = node.inner.state.write().await;
            state.role = RaftRole::Leader;
            state.current_term = 1;
        }

        // no peers are reachable, so the change stays pending
        let first = node.add_node("node-4", Duration::from_millis(100)).await;
        assert!(matches!(first, Err(RaftError::Timeout)));

        let second = node
            .add_node("node-5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(second, RaftError::ConfigChangePending));
    }
}
