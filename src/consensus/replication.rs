// Log replication
//
// Leader side: heartbeat/replication fan-out, reply integration with fast
// conflict backtracking, commit-index advancement, snapshot shipping for
// far-behind peers. Follower side: AppendEntries and InstallSnapshot
// handlers with the log-consistency check and optimistic truncation.

use crate::consensus::membership::ClusterSet;
use crate::consensus::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, Snapshot, Term,
};
use crate::consensus::{NodeInner, RaftRole, RaftState};
use crate::error::{RaftError, Result};
use crate::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
pub(crate) struct ReplicationManager {
    inner: Arc<NodeInner>,
}

enum Payload {
    Entries(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// Largest index replicated on a strict majority of the voting set whose
/// entry carries the current term. Entries from earlier terms ride over the
/// quorum line only behind such an entry.
pub(crate) fn advance_commit_index(node_id: &NodeId, state: &mut RaftState) -> bool {
    if state.members.is_empty() {
        return false;
    }
    let mut indices: Vec<LogIndex> = state
        .members
        .ids()
        .iter()
        .map(|id| {
            if id == node_id {
                state.log.last_index()
            } else {
                state.match_index.get(id).copied().unwrap_or(0)
            }
        })
        .collect();
    indices.sort_unstable();
    indices.reverse();

    let candidate = indices[state.members.len() / 2];
    if candidate > state.commit_index && state.log.term_at(candidate) == Some(state.current_term) {
        state.commit_index = candidate;
        tracing::debug!(node_id = %node_id, commit_index = candidate, "advanced commit index");
        return true;
    }
    false
}

/// Recompute the voting set from the snapshot membership (or the configured
/// initial peers) plus whatever membership entries survive in the window.
fn rebuild_membership(inner: &NodeInner, state: &mut RaftState) {
    let (base, base_version) = match state.log.snapshot() {
        Some(s) => (s.members.clone(), s.last_included_index),
        None => (inner.config.initial_peers.clone(), 0),
    };
    state.members = ClusterSet::rebuild(base, base_version, state.log.iter());
    tracing::debug!(
        node_id = %inner.node_id,
        members = ?state.members.ids(),
        "membership recomputed from log"
    );
}

impl ReplicationManager {
    pub fn new(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Heartbeat loop: fires on the heartbeat interval and whenever the
    /// node asks for an immediate replication round.
    pub async fn run(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.inner.config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
                _ = self.inner.replicate_notify.notified() => {}
            }
            self.broadcast().await;
        }
    }

    /// Fan replication out to every peer; each peer gets its own task so a
    /// slow follower never stalls the others.
    pub async fn broadcast(&self) {
        let peers = {
            let state = self.inner.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            state.members.others(&self.inner.node_id)
        };
        for peer in peers {
            let manager = self.clone();
            tokio::spawn(async move { manager.replicate_to(peer).await });
        }
    }

    async fn replicate_to(&self, peer: NodeId) {
        let built = {
            let state = self.inner.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let term = state.current_term;
            let next = state
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(state.log.last_index() + 1);

            if next <= state.log.base_index() {
                // the peer is behind the compacted prefix
                let Some(snapshot) = state.log.snapshot() else {
                    return;
                };
                (
                    Payload::Snapshot(InstallSnapshotRequest {
                        term,
                        leader_id: self.inner.node_id.clone(),
                        last_included_index: snapshot.last_included_index,
                        last_included_term: snapshot.last_included_term,
                        members: snapshot.members.clone(),
                        data: snapshot.data.clone(),
                    }),
                    term,
                )
            } else {
                let prev_log_index = next - 1;
                let Some(prev_log_term) = state.log.term_at(prev_log_index) else {
                    return;
                };
                (
                    Payload::Entries(AppendEntriesRequest {
                        term,
                        leader_id: self.inner.node_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries: state
                            .log
                            .entries_from(next, self.inner.config.max_entries_per_append),
                        leader_commit: state.commit_index,
                    }),
                    term,
                )
            }
        };

        match built {
            (Payload::Entries(request), sent_term) => {
                let prev = request.prev_log_index;
                let count = request.entries.len() as u64;
                match self.inner.transport.append_entries(&peer, request).await {
                    Ok(reply) => {
                        self.handle_append_reply(&peer, sent_term, prev, count, reply)
                            .await
                    }
                    // no reply; the next heartbeat retries
                    Err(e) => tracing::trace!(
                        node_id = %self.inner.node_id,
                        peer = %peer,
                        error = %e,
                        "append entries failed"
                    ),
                }
            }
            (Payload::Snapshot(request), sent_term) => {
                let last_included = request.last_included_index;
                match self.inner.transport.install_snapshot(&peer, request).await {
                    Ok(reply) => {
                        self.handle_snapshot_reply(&peer, sent_term, last_included, reply)
                            .await
                    }
                    Err(e) => tracing::trace!(
                        node_id = %self.inner.node_id,
                        peer = %peer,
                        error = %e,
                        "install snapshot failed"
                    ),
                }
            }
        }
    }

    pub(crate) async fn handle_append_reply(
        &self,
        peer: &NodeId,
        sent_term: Term,
        prev_log_index: LogIndex,
        sent_count: u64,
        reply: AppendEntriesResponse,
    ) {
        let mut state = self.inner.state.write().await;
        if reply.term > state.current_term {
            self.inner.step_down(&mut state, reply.term);
            state.leader_id = None;
            if let Err(e) = self.inner.persist(&state).await {
                tracing::error!(node_id = %self.inner.node_id, error = %e, "failed to persist term update");
            }
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != sent_term {
            return;
        }
        if !state.members.contains(peer) {
            // removed while the RPC was in flight
            return;
        }

        if reply.success {
            let matched = prev_log_index + sent_count;
            let match_entry = state.match_index.entry(peer.clone()).or_insert(0);
            if matched > *match_entry {
                *match_entry = matched;
            }
            let next_entry = state.next_index.entry(peer.clone()).or_insert(1);
            if matched + 1 > *next_entry {
                *next_entry = matched + 1;
            }
            if advance_commit_index(&self.inner.node_id, &mut state) {
                self.inner.apply_notify.notify_one();
            }
            return;
        }

        // fast backtracking from the follower's conflict hints
        let old_next = state
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(prev_log_index + 1);
        let new_next = match (reply.conflict_term, reply.conflict_index) {
            (Some(conflict_term), conflict_index) => {
                match state.log.last_index_of_term(conflict_term) {
                    Some(index) => index + 1,
                    None => conflict_index.unwrap_or_else(|| old_next.saturating_sub(1)),
                }
            }
            (None, Some(conflict_index)) if conflict_index > 0 => conflict_index,
            _ => old_next.saturating_sub(1),
        }
        .max(1);
        state.next_index.insert(peer.clone(), new_next);
        tracing::debug!(
            node_id = %self.inner.node_id,
            peer = %peer,
            next_index = new_next,
            "follower log conflict, probing lower"
        );
        self.inner.replicate_notify.notify_one();
    }

    pub(crate) async fn handle_snapshot_reply(
        &self,
        peer: &NodeId,
        sent_term: Term,
        last_included: LogIndex,
        reply: InstallSnapshotResponse,
    ) {
        let mut state = self.inner.state.write().await;
        if reply.term > state.current_term {
            self.inner.step_down(&mut state, reply.term);
            state.leader_id = None;
            if let Err(e) = self.inner.persist(&state).await {
                tracing::error!(node_id = %self.inner.node_id, error = %e, "failed to persist term update");
            }
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != sent_term {
            return;
        }
        if !state.members.contains(peer) {
            return;
        }

        state.next_index.insert(peer.clone(), last_included + 1);
        let match_entry = state.match_index.entry(peer.clone()).or_insert(0);
        if last_included > *match_entry {
            *match_entry = last_included;
        }
        tracing::info!(
            node_id = %self.inner.node_id,
            peer = %peer,
            last_included,
            "peer accepted snapshot"
        );
        // follow up with whatever sits above the snapshot
        self.inner.replicate_notify.notify_one();
    }

    /// AppendEntries RPC handler (follower side).
    pub(crate) async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.inner.state.write().await;

        if request.term > state.current_term {
            self.inner.step_down(&mut state, request.term);
            self.inner.persist(&state).await?;
        }
        if request.term < state.current_term {
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            });
        }

        // a legitimate leader for this term
        if state.role != RaftRole::Follower {
            state.role = RaftRole::Follower;
            state.votes_received.clear();
            state.pending_config = None;
            let leader = request.leader_id.clone();
            state.pending.fail_all(|| RaftError::NotLeader {
                leader_id: Some(leader.clone()),
            });
        }
        state.leader_id = Some(request.leader_id.clone());
        self.inner.election_reset.notify_one();

        let base = state.log.base_index();
        let mut prev_log_index = request.prev_log_index;
        let mut check_prev = prev_log_index > 0;
        let mut entries = request.entries;

        // everything at or below the snapshot base is committed here already
        if prev_log_index < base {
            let covered = base - prev_log_index;
            if entries.len() as u64 <= covered {
                if request.leader_commit > state.commit_index {
                    state.commit_index = request.leader_commit.min(base);
                    self.inner.apply_notify.notify_one();
                }
                return Ok(AppendEntriesResponse {
                    term: state.current_term,
                    success: true,
                    conflict_index: None,
                    conflict_term: None,
                });
            }
            entries.drain(..covered as usize);
            prev_log_index = base;
            check_prev = false;
        }

        if check_prev {
            match state.log.term_at(prev_log_index) {
                None => {
                    // nothing at prev yet; tell the leader where our log ends
                    return Ok(AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        conflict_index: Some(state.log.last_index() + 1),
                        conflict_term: None,
                    });
                }
                Some(local_term) if local_term != request.prev_log_term => {
                    let conflict_index = state
                        .log
                        .first_index_of_term(local_term)
                        .unwrap_or(prev_log_index);
                    return Ok(AppendEntriesResponse {
                        term: state.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: Some(local_term),
                    });
                }
                Some(_) => {}
            }
        }

        let mut appended = false;
        let mut membership_touched = false;
        for entry in &entries {
            match state.log.term_at(entry.index) {
                // identical entry already in place; never rewrite it
                Some(local_term) if local_term == entry.term => continue,
                Some(_) => {
                    // conflicting tail from a deposed leader; a conflict at
                    // or below the commit index would violate Raft safety
                    if entry.index <= state.commit_index {
                        tracing::error!(
                            node_id = %self.inner.node_id,
                            index = entry.index,
                            commit_index = state.commit_index,
                            "refusing to truncate committed entries"
                        );
                        return Err(RaftError::InvalidAppend {
                            expected: state.commit_index + 1,
                            got: entry.index,
                        });
                    }
                    membership_touched |= state.log.has_membership_change_from(entry.index);
                    state.log.truncate_from(entry.index)?;
                    state.log.append(entry.clone())?;
                    appended = true;
                    membership_touched |= entry.command.is_membership_change();
                }
                None => {
                    state.log.append(entry.clone())?;
                    appended = true;
                    membership_touched |= entry.command.is_membership_change();
                }
            }
        }

        if membership_touched {
            rebuild_membership(&self.inner, &mut state);
        }

        let last_new = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(last_new);
            self.inner.apply_notify.notify_one();
        }

        if appended {
            self.inner.persist(&state).await?;
        }

        Ok(AppendEntriesResponse {
            term: state.current_term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        })
    }

    /// InstallSnapshot RPC handler (follower side). The log collapses to the
    /// snapshot's sentinel; the state machine is restored by the apply loop,
    /// which owns all state-machine access.
    pub(crate) async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.inner.state.write().await;

        if request.term > state.current_term {
            self.inner.step_down(&mut state, request.term);
            self.inner.persist(&state).await?;
        }
        if request.term < state.current_term {
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
            });
        }

        if state.role != RaftRole::Follower {
            state.role = RaftRole::Follower;
            state.votes_received.clear();
            state.pending_config = None;
            let leader = request.leader_id.clone();
            state.pending.fail_all(|| RaftError::NotLeader {
                leader_id: Some(leader.clone()),
            });
        }
        state.leader_id = Some(request.leader_id.clone());
        self.inner.election_reset.notify_one();

        if request.last_included_index <= state.log.base_index() {
            // our own snapshot already covers this prefix
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
            });
        }

        let snapshot = Snapshot {
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
            members: request.members,
            data: request.data,
        };

        tracing::info!(
            node_id = %self.inner.node_id,
            last_included_index = snapshot.last_included_index,
            last_included_term = snapshot.last_included_term,
            "installing snapshot from leader"
        );

        self.inner.storage.save_snapshot(&snapshot).await?;
        state.log.install_snapshot(snapshot.clone());
        state.members = ClusterSet::from_members(
            snapshot.members.clone(),
            snapshot.last_included_index,
        );
        state.commit_index = state.commit_index.max(snapshot.last_included_index);
        state.pending_restore = Some(snapshot);
        self.inner.persist(&state).await?;
        self.inner.apply_notify.notify_one();

        Ok(InstallSnapshotResponse {
            term: state.current_term,
        })
    }

    /// Quorum leadership confirmation for linearizable reads: one round of
    /// empty AppendEntries, counting any reply at or below the read term as
    /// an ack and failing on any sign of a newer term.
    pub(crate) async fn confirm_leadership(&self, term: Term, window: Duration) -> Result<()> {
        let (peers, quorum) = {
            let state = self.inner.state.read().await;
            if state.role != RaftRole::Leader || state.current_term != term {
                return Err(RaftError::NotLeader {
                    leader_id: state.leader_id.clone(),
                });
            }
            (
                state.members.others(&self.inner.node_id),
                state.members.quorum(),
            )
        };
        if quorum <= 1 {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for peer in peers {
            let manager = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let probe = {
                    let state = manager.inner.state.read().await;
                    if state.role != RaftRole::Leader || state.current_term != term {
                        return;
                    }
                    AppendEntriesRequest {
                        term,
                        leader_id: manager.inner.node_id.clone(),
                        prev_log_index: state.log.last_index(),
                        prev_log_term: state.log.last_term(),
                        entries: Vec::new(),
                        leader_commit: state.commit_index,
                    }
                };
                match manager.inner.transport.append_entries(&peer, probe).await {
                    Ok(reply) if reply.term > term => {
                        manager.inner.observe_higher_term(reply.term).await;
                        let _ = tx.send(false);
                    }
                    Ok(_) => {
                        let _ = tx.send(true);
                    }
                    Err(_) => {} // lost reply; not an ack
                }
            });
        }
        drop(tx);

        let collect = async {
            let mut acks = 1usize; // self
            while acks < quorum {
                match rx.recv().await {
                    Some(true) => acks += 1,
                    Some(false) | None => return false,
                }
            }
            true
        };

        match tokio::time::timeout(window, collect).await {
            Ok(true) => {
                let state = self.inner.state.read().await;
                if state.role == RaftRole::Leader && state.current_term == term {
                    Ok(())
                } else {
                    Err(RaftError::NotLeader {
                        leader_id: state.leader_id.clone(),
                    })
                }
            }
            _ => Err(RaftError::NotLeader { leader_id: None }),
        }
    }
}
