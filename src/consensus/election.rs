// Leader election
//
// Election timer, candidate transitions, and RequestVote handling.
// The timer draws a fresh randomized deadline on every reset; a vote is
// granted only to a candidate whose log is at least as up-to-date, and
// granting one refreshes the deadline.

use crate::consensus::messages::{Command, LogEntry, Term, VoteRequest, VoteResponse};
use crate::consensus::{replication, NodeInner, RaftRole, RaftState};
use crate::error::Result;
use crate::NodeId;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct ElectionManager {
    inner: Arc<NodeInner>,
}

/// Yes-votes from nodes that are actually in the current voting set.
fn granted_votes(state: &RaftState) -> usize {
    state
        .votes_received
        .iter()
        .filter(|(id, granted)| **granted && state.members.contains(id))
        .count()
}

impl ElectionManager {
    pub fn new(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Election timer loop. Leaders sit out; everyone else campaigns when
    /// the randomized deadline elapses without a legitimate reset.
    pub async fn run(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            let deadline = self.inner.config.random_election_timeout();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.inner.election_reset.notified() => continue,
                _ = tokio::time::sleep(deadline) => {
                    let role = self.inner.state.read().await.role;
                    if role != RaftRole::Leader {
                        self.start_election().await;
                    }
                }
            }
        }
    }

    /// Enter candidate state and solicit votes.
    pub async fn start_election(&self) {
        let solicit = {
            let mut state = self.inner.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.role = RaftRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.inner.node_id.clone());
            state.leader_id = None;
            state.votes_received.clear();
            state
                .votes_received
                .insert(self.inner.node_id.clone(), true);

            // term and self-vote must be durable before any ballot goes out
            if let Err(e) = self.inner.persist(&state).await {
                tracing::error!(
                    node_id = %self.inner.node_id,
                    error = %e,
                    "failed to persist candidate state, aborting election"
                );
                return;
            }

            tracing::info!(
                node_id = %self.inner.node_id,
                term = state.current_term,
                "starting election"
            );

            if granted_votes(&state) >= state.members.quorum() {
                // single-node cluster: the self-vote is the quorum
                if let Err(e) = self.become_leader(&mut state).await {
                    tracing::error!(node_id = %self.inner.node_id, error = %e, "failed to take leadership");
                }
                None
            } else {
                let request = VoteRequest {
                    term: state.current_term,
                    candidate_id: self.inner.node_id.clone(),
                    last_log_index: state.log.last_index(),
                    last_log_term: state.log.last_term(),
                };
                Some((
                    request,
                    state.members.others(&self.inner.node_id),
                    state.current_term,
                ))
            }
        };

        let Some((request, peers, election_term)) = solicit else {
            self.inner.replicate_notify.notify_one();
            return;
        };

        for peer in peers {
            let manager = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                match manager.inner.transport.request_vote(&peer, request).await {
                    Ok(reply) => manager.handle_vote_reply(peer, election_term, reply).await,
                    Err(e) => tracing::trace!(
                        node_id = %manager.inner.node_id,
                        peer = %peer,
                        error = %e,
                        "vote request failed"
                    ),
                }
            });
        }
    }

    /// Integrate a vote reply; promotes to leader on quorum.
    pub async fn handle_vote_reply(&self, from: NodeId, election_term: Term, reply: VoteResponse) {
        let became_leader = {
            let mut state = self.inner.state.write().await;
            if reply.term > state.current_term {
                self.inner.step_down(&mut state, reply.term);
                state.leader_id = None;
                if let Err(e) = self.inner.persist(&state).await {
                    tracing::error!(node_id = %self.inner.node_id, error = %e, "failed to persist term update");
                }
                return;
            }
            if state.role != RaftRole::Candidate || state.current_term != election_term {
                // stale reply from a previous election
                return;
            }
            state.votes_received.insert(from, reply.vote_granted);
            if granted_votes(&state) < state.members.quorum() {
                false
            } else {
                match self.become_leader(&mut state).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(node_id = %self.inner.node_id, error = %e, "failed to take leadership");
                        false
                    }
                }
            }
        };
        if became_leader {
            self.inner.replicate_notify.notify_one();
        }
    }

    /// Transition to leader: reset the replication tables and append the
    /// barrier entry that will carry earlier terms' entries to commit.
    async fn become_leader(&self, state: &mut RaftState) -> Result<()> {
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.inner.node_id.clone());

        let next = state.log.last_index() + 1;
        state.next_index.clear();
        state.match_index.clear();
        for peer in state.members.others(&self.inner.node_id) {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }

        state
            .log
            .append(LogEntry::new(state.current_term, next, Command::Noop))?;
        self.inner.persist(state).await?;

        tracing::info!(
            node_id = %self.inner.node_id,
            term = state.current_term,
            last_log_index = state.log.last_index(),
            "elected leader"
        );

        // a single-node cluster commits the barrier on its own
        if replication::advance_commit_index(&self.inner.node_id, state) {
            self.inner.apply_notify.notify_one();
        }
        Ok(())
    }

    /// RequestVote RPC handler.
    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.inner.state.write().await;
        let mut dirty = false;

        if request.term > state.current_term {
            self.inner.step_down(&mut state, request.term);
            state.leader_id = None;
            dirty = true;
        }

        let mut granted = false;
        if request.term == state.current_term {
            let can_vote = state.voted_for.is_none()
                || state.voted_for.as_ref() == Some(&request.candidate_id);
            let log_ok = request.last_log_term > state.log.last_term()
                || (request.last_log_term == state.log.last_term()
                    && request.last_log_index >= state.log.last_index());
            if can_vote && log_ok {
                state.voted_for = Some(request.candidate_id.clone());
                granted = true;
                dirty = true;
            }
        }

        // the grant (or the adopted term) must be durable before it is released
        if dirty {
            self.inner.persist(&state).await?;
        }

        if granted {
            self.inner.election_reset.notify_one();
            tracing::debug!(
                node_id = %self.inner.node_id,
                candidate = %request.candidate_id,
                term = state.current_term,
                "vote granted"
            );
        }

        Ok(VoteResponse {
            term: state.current_term,
            vote_granted: granted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::test_support::test_node;
    use crate::consensus::RaftRole;

    fn vote_request(term: Term, candidate: &str, last_index: u64, last_term: Term) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    #[tokio::test]
    async fn test_grant_vote_to_fresh_candidate() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;

        let reply = node
            .handle_request_vote(vote_request(1, "node-2", 0, 0))
            .await
            .unwrap();
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);

        let state = node.inner.state.read().await;
        assert_eq!(state.voted_for.as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn test_reject_stale_term() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        node.inner.state.write().await.current_term = 5;

        let reply = node
            .handle_request_vote(vote_request(3, "node-2", 10, 3))
            .await
            .unwrap();
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn test_reject_second_candidate_same_term() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;

        let first = node
            .handle_request_vote(vote_request(2, "node-2", 0, 0))
            .await
            .unwrap();
        assert!(first.vote_granted);

        let second = node
            .handle_request_vote(vote_request(2, "node-3", 0, 0))
            .await
            .unwrap();
        assert!(!second.vote_granted);

        // the same candidate may ask again, e.g. after a lost reply
        let again = node
            .handle_request_vote(vote_request(2, "node-2", 0, 0))
            .await
            .unwrap();
        assert!(again.vote_granted);
    }

    #[tokio::test]
    async fn test_reject_candidate_with_stale_log() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        {
            let mut state = node.inner.state.write().await;
            state.current_term = 2;
            state.log.append(LogEntry::new(1, 1, Command::Noop)).unwrap();
            state.log.append(LogEntry::new(2, 2, Command::Noop)).unwrap();
        }

        // shorter log at the same last term
        let reply = node
            .handle_request_vote(vote_request(3, "node-2", 1, 2))
            .await
            .unwrap();
        assert!(!reply.vote_granted);

        // older last term loses even with a longer log
        let reply = node
            .handle_request_vote(vote_request(3, "node-2", 10, 1))
            .await
            .unwrap();
        assert!(!reply.vote_granted);

        // equal last term and equal length wins the comparison
        let reply = node
            .handle_request_vote(vote_request(3, "node-2", 2, 2))
            .await
            .unwrap();
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn test_higher_term_steps_candidate_down() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        {
            let mut state = node.inner.state.write().await;
            state.role = RaftRole::Candidate;
            state.current_term = 4;
            state.voted_for = Some("node-1".into());
        }

        let reply = node
            .handle_request_vote(vote_request(7, "node-3", 0, 0))
            .await
            .unwrap();
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 7);

        let state = node.inner.state.read().await;
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for.as_deref(), Some("node-3"));
    }

    #[tokio::test]
    async fn test_single_node_election_wins_immediately() {
        let node = test_node("node-1", &["node-1"]).await;
        node.election.start_election().await;

        let state = node.inner.state.read().await;
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.current_term, 1);
        // the barrier entry is in place
        assert_eq!(state.log.last_index(), 1);
        assert_eq!(state.log.entry_at(1).map(|e| &e.command), Some(&Command::Noop));
        assert_eq!(state.commit_index, 1);
    }

    #[tokio::test]
    async fn test_vote_reply_quorum_promotes_candidate() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        node.election.start_election().await;
        {
            let state = node.inner.state.read().await;
            assert_eq!(state.role, RaftRole::Candidate);
            assert_eq!(state.current_term, 1);
        }

        node.election
            .handle_vote_reply(
                "node-2".into(),
                1,
                VoteResponse {
                    term: 1,
                    vote_granted: true,
                },
            )
            .await;

        let state = node.inner.state.read().await;
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id.as_deref(), Some("node-1"));
        assert_eq!(state.next_index.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_vote_reply_ignored() {
        let node = test_node("node-1", &["node-1", "node-2", "node-3"]).await;
        node.election.start_election().await;
        node.election.start_election().await; // term 2 now

        node.election
            .handle_vote_reply(
                "node-2".into(),
                1,
                VoteResponse {
                    term: 1,
                    vote_granted: true,
                },
            )
            .await;

        let state = node.inner.state.read().await;
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 2);
    }
}
