//! The Raft peer state machine.
//!
//! A pure state machine: inputs are timer fires, incoming messages and
//! proposals; outputs are messages to send, timers to reset, persistent
//! state to save and committed entries to apply. It performs no I/O, which
//! is what makes elections and partitions testable by shuttling messages
//! between peers in a loop.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use lattice_core::{LogIndex, NodeId, TermId};
use lattice_durability::StateDelta;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::RaftConfig;
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::storage::PersistentState;

/// Raft peer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    /// Passive; responds to RPCs.
    #[default]
    Follower,
    /// Actively seeking votes.
    Candidate,
    /// Handles proposals, replicates the log.
    Leader,
}

/// Output actions from the Raft state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftOutput {
    /// Send a message to another peer.
    SendMessage(Message),
    /// Re-arm the election timer with a freshly randomised timeout.
    ResetElectionTimer(Duration),
    /// Re-arm the heartbeat timer.
    ResetHeartbeatTimer,
    /// Save the persistent state before answering further RPCs.
    PersistState(PersistentState),
    /// A log entry is committed and must be applied. Apply order is
    /// strictly ascending by index; a failed apply halts the driver.
    CommitEntry {
        /// The log index of the committed entry.
        index: LogIndex,
        /// The committed delta.
        delta: StateDelta,
    },
    /// This peer became leader.
    BecameLeader,
    /// This peer stepped down from leadership.
    SteppedDown,
}

/// A Raft peer specialised to [`StateDelta`] commands.
#[derive(Debug)]
pub struct RaftPeer {
    /// Configuration.
    config: RaftConfig,

    // Persistent state (saved via `RaftOutput::PersistState` and the WAL).
    /// Current term.
    current_term: TermId,
    /// Who we voted for in the current term.
    voted_for: Option<NodeId>,
    /// The log.
    log: RaftLog,

    // Volatile state on all peers.
    /// Current role.
    role: RaftRole,
    /// Index of the highest log entry known to be committed.
    commit_index: LogIndex,
    /// Index of the highest log entry applied to the state machine.
    last_applied: LogIndex,

    // Volatile state on leaders (reinitialised after election).
    /// For each peer, index of the next log entry to send.
    next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, index of the highest entry known to be replicated.
    match_index: HashMap<NodeId, LogIndex>,

    // Candidate state.
    /// Votes received in the current election.
    votes_received: HashSet<NodeId>,

    /// Current leader, if known.
    leader_id: Option<NodeId>,

    /// Election timeout randomness.
    rng: ChaCha8Rng,
}

impl RaftPeer {
    /// Creates a new Raft peer.
    #[must_use]
    pub fn new(config: RaftConfig) -> Self {
        let peers = config.peers();
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in &peers {
            next_index.insert(*peer, LogIndex::new(1));
            match_index.insert(*peer, LogIndex::new(0));
        }

        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            current_term: TermId::new(0),
            voted_for: None,
            log: RaftLog::new(),
            role: RaftRole::Follower,
            commit_index: LogIndex::new(0),
            last_applied: LogIndex::new(0),
            next_index,
            match_index,
            votes_received: HashSet::new(),
            leader_id: None,
            rng,
        }
    }

    /// Restores persistent state after a restart.
    pub fn restore(&mut self, state: &PersistentState) {
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
    }

    /// Returns this peer's ID.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role(&self) -> RaftRole {
        self.role
    }

    /// Returns true if this peer is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// Returns the current leader ID if known, the `NotLeader` hint.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the last applied index.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns a reference to the log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the persistent part of this peer's state.
    #[must_use]
    pub const fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// Draws a fresh randomised election timeout.
    #[allow(clippy::cast_possible_truncation)] // Timeouts are far below u64 millis.
    fn random_election_timeout(&mut self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    /// Handles an election timeout firing.
    pub fn handle_election_timeout(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        // Leaders do not start elections.
        if self.role == RaftRole::Leader {
            return outputs;
        }

        // Start election: increment term, become candidate, vote for self.
        let prev_term = self.current_term;
        self.current_term = TermId::new(self.current_term.get() + 1);
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.config.node_id);
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);
        self.leader_id = None;

        debug_assert!(self.current_term.get() == prev_term.get() + 1);
        debug!(
            node = self.config.node_id.get(),
            term = self.current_term.get(),
            "Starting election"
        );

        outputs.push(RaftOutput::PersistState(self.persistent_state()));
        let timeout = self.random_election_timeout();
        outputs.push(RaftOutput::ResetElectionTimer(timeout));

        for peer in self.config.peers() {
            let request = RequestVoteRequest::new(
                self.current_term,
                self.config.node_id,
                peer,
                self.log.last_index(),
                self.log.last_term(),
            );
            outputs.push(RaftOutput::SendMessage(Message::RequestVote(request)));
        }

        // Single-peer group: quorum is already reached.
        if self.votes_received.len() >= self.config.quorum_size() {
            outputs.extend(self.become_leader());
        }

        debug_assert!(self.role == RaftRole::Candidate || self.role == RaftRole::Leader);
        outputs
    }

    /// Handles a heartbeat timeout firing (leader only).
    pub fn handle_heartbeat_timeout(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.role != RaftRole::Leader {
            return outputs;
        }

        debug_assert!(self.leader_id == Some(self.config.node_id));

        for peer in self.config.peers() {
            outputs.extend(self.send_append_entries(peer));
        }
        outputs.push(RaftOutput::ResetHeartbeatTimer);
        outputs
    }

    /// Proposes a delta for replication (leader only).
    ///
    /// Returns the assigned log index and the actions to take, or `None`
    /// if this peer is not the leader (the caller answers `NotLeader` with
    /// [`Self::leader_id`] as the hint).
    pub fn propose(&mut self, delta: StateDelta) -> Option<(LogIndex, Vec<RaftOutput>)> {
        if self.role != RaftRole::Leader {
            return None;
        }

        let mut outputs = Vec::new();
        let index = LogIndex::new(self.log.last_index().get() + 1);
        self.log
            .append(LogEntry::new(self.current_term, index, delta));

        for peer in self.config.peers() {
            outputs.extend(self.send_append_entries(peer));
        }

        // Might commit immediately in a single-peer group.
        outputs.extend(self.try_advance_commit_index());

        Some((index, outputs))
    }

    /// Handles an incoming message.
    pub fn handle_message(&mut self, message: Message) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        // A newer term always forces a step-down first.
        let msg_term = message.term();
        if msg_term > self.current_term {
            outputs.extend(self.step_down(msg_term));
        }

        match message {
            Message::RequestVote(req) => outputs.extend(self.handle_request_vote(req)),
            Message::RequestVoteResponse(resp) => {
                outputs.extend(self.handle_request_vote_response(resp));
            }
            Message::AppendEntries(req) => outputs.extend(self.handle_append_entries(req)),
            Message::AppendEntriesResponse(resp) => {
                outputs.extend(self.handle_append_entries_response(resp));
            }
        }

        outputs
    }

    /// Compacts the log at an install-snapshot boundary.
    pub fn compact_log_to(&mut self, last_included_index: LogIndex) {
        assert!(
            last_included_index <= self.last_applied,
            "cannot compact past the applied prefix"
        );
        self.log.compact_to(last_included_index);
    }

    /// Steps down to follower and adopts the new term.
    fn step_down(&mut self, new_term: TermId) -> Vec<RaftOutput> {
        let was_leader = self.role == RaftRole::Leader;
        self.current_term = new_term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.votes_received.clear();

        let mut outputs = vec![RaftOutput::PersistState(self.persistent_state())];
        if was_leader {
            outputs.push(RaftOutput::SteppedDown);
            let timeout = self.random_election_timeout();
            outputs.push(RaftOutput::ResetElectionTimer(timeout));
        }
        outputs
    }

    /// Handles a `RequestVote` request.
    fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        let vote_granted = self.should_grant_vote(&req);
        if vote_granted {
            self.voted_for = Some(req.candidate_id);
            outputs.push(RaftOutput::PersistState(self.persistent_state()));
            let timeout = self.random_election_timeout();
            outputs.push(RaftOutput::ResetElectionTimer(timeout));
        }

        let response = RequestVoteResponse::new(
            self.current_term,
            self.config.node_id,
            req.candidate_id,
            vote_granted,
        );
        outputs.push(RaftOutput::SendMessage(Message::RequestVoteResponse(
            response,
        )));
        outputs
    }

    /// The voting rule: current term, no conflicting vote this term, and a
    /// candidate log at least as up-to-date as ours.
    fn should_grant_vote(&self, req: &RequestVoteRequest) -> bool {
        if req.term < self.current_term {
            return false;
        }

        let can_vote = match self.voted_for {
            None => true,
            Some(id) => id == req.candidate_id,
        };
        if !can_vote {
            return false;
        }

        self.log.is_up_to_date(req.last_log_term, req.last_log_index)
    }

    /// Handles a `RequestVote` response.
    fn handle_request_vote_response(&mut self, resp: RequestVoteResponse) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if self.role != RaftRole::Candidate || resp.term != self.current_term {
            return outputs;
        }

        if resp.vote_granted {
            self.votes_received.insert(resp.from);
            if self.votes_received.len() >= self.config.quorum_size() {
                outputs.extend(self.become_leader());
            }
        }

        outputs
    }

    /// Becomes leader.
    fn become_leader(&mut self) -> Vec<RaftOutput> {
        debug_assert!(self.votes_received.len() >= self.config.quorum_size());

        self.role = RaftRole::Leader;
        self.leader_id = Some(self.config.node_id);

        let next_idx = LogIndex::new(self.log.last_index().get() + 1);
        for peer in self.config.peers() {
            self.next_index.insert(peer, next_idx);
            self.match_index.insert(peer, LogIndex::new(0));
        }

        debug!(
            node = self.config.node_id.get(),
            term = self.current_term.get(),
            "Became leader"
        );

        let mut outputs = vec![RaftOutput::BecameLeader, RaftOutput::ResetHeartbeatTimer];
        for peer in self.config.peers() {
            outputs.extend(self.send_append_entries(peer));
        }

        debug_assert!(self.role == RaftRole::Leader);
        outputs
    }

    /// Handles an `AppendEntries` request.
    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        // Reject a stale leader.
        if req.term < self.current_term {
            let response = AppendEntriesResponse::new(
                self.current_term,
                self.config.node_id,
                req.leader_id,
                false,
                self.log.last_index(),
            );
            outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
                response,
            )));
            return outputs;
        }

        // Valid leader for this term; candidates yield.
        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes_received.clear();
        }
        self.leader_id = Some(req.leader_id);

        let timeout = self.random_election_timeout();
        outputs.push(RaftOutput::ResetElectionTimer(timeout));

        // Consistency check on the previous entry.
        let log_ok = req.prev_log_index.get() == 0
            || self.log.term_at(req.prev_log_index) == req.prev_log_term;
        if !log_ok {
            let response = AppendEntriesResponse::new(
                self.current_term,
                self.config.node_id,
                req.leader_id,
                false,
                self.log.last_index(),
            );
            outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
                response,
            )));
            return outputs;
        }

        // Truncate a conflicting suffix and append.
        if !req.entries.is_empty() {
            self.log.append_entries(req.entries);
        }

        // Advance commit to the leader's, bounded by our log.
        if req.leader_commit > self.commit_index {
            let new_commit = std::cmp::min(req.leader_commit, self.log.last_index());
            outputs.extend(self.apply_committed_entries(new_commit));
        }

        let response = AppendEntriesResponse::new(
            self.current_term,
            self.config.node_id,
            req.leader_id,
            true,
            self.log.last_index(),
        );
        outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
            response,
        )));
        outputs
    }

    /// Handles an `AppendEntries` response (leader only).
    fn handle_append_entries_response(
        &mut self,
        resp: AppendEntriesResponse,
    ) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if self.role != RaftRole::Leader || resp.term != self.current_term {
            return outputs;
        }

        if resp.success {
            let new_match = resp.match_index;
            self.match_index.insert(resp.from, new_match);
            self.next_index
                .insert(resp.from, LogIndex::new(new_match.get() + 1));

            outputs.extend(self.try_advance_commit_index());
        } else {
            // Back up and retry immediately.
            let next = self
                .next_index
                .get(&resp.from)
                .copied()
                .unwrap_or(LogIndex::new(1));
            if next.get() > 1 {
                self.next_index
                    .insert(resp.from, LogIndex::new(next.get() - 1));
            }
            outputs.extend(self.send_append_entries(resp.from));
        }

        outputs
    }

    /// Builds an `AppendEntries` for one peer from its `next_index`.
    fn send_append_entries(&self, peer: NodeId) -> Vec<RaftOutput> {
        let next_idx = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(1));
        let prev_idx = LogIndex::new(next_idx.get().saturating_sub(1));
        let prev_term = self.log.term_at(prev_idx);
        let entries = self.log.entries_from(next_idx);

        let request = AppendEntriesRequest::new(
            self.current_term,
            self.config.node_id,
            peer,
            prev_idx,
            prev_term,
            entries,
            self.commit_index,
        );
        vec![RaftOutput::SendMessage(Message::AppendEntries(request))]
    }

    /// Advances the commit index over entries replicated on a majority.
    ///
    /// An entry commits only when replicated on a quorum *and* its term is
    /// the leader's current term.
    fn try_advance_commit_index(&mut self) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }

        let prev_commit = self.commit_index;
        let mut outputs = Vec::new();

        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let idx = LogIndex::new(n);

            if self.log.term_at(idx) != self.current_term {
                continue;
            }

            // The leader implicitly holds its own entries.
            let mut count = 1;
            for peer in self.config.peers() {
                if let Some(&match_idx) = self.match_index.get(&peer) {
                    if match_idx >= idx {
                        count += 1;
                    }
                }
            }

            if count >= self.config.quorum_size() {
                outputs.extend(self.apply_committed_entries(idx));
            }
        }

        debug_assert!(self.commit_index >= prev_commit);
        outputs
    }

    /// Emits `CommitEntry` outputs up to the new commit index, strictly
    /// ascending, one at a time.
    fn apply_committed_entries(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        debug_assert!(new_commit <= self.log.last_index());

        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let idx = LogIndex::new(self.last_applied.get() + 1);
            if let Some(entry) = self.log.get(idx) {
                outputs.push(RaftOutput::CommitEntry {
                    index: idx,
                    delta: entry.delta.clone(),
                });
            }
            self.last_applied = idx;
        }

        debug_assert!(self.last_applied == self.commit_index);
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::{Gid, TxId};

    fn make_config(node_id: u64) -> RaftConfig {
        RaftConfig::new(
            NodeId::new(node_id),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
        )
    }

    fn delta(tx: u64) -> StateDelta {
        StateDelta::CreateVertex {
            tx: TxId::new(tx),
            vertex: Gid::new(tx),
        }
    }

    #[test]
    fn test_new_peer_is_follower() {
        let peer = RaftPeer::new(make_config(1));

        assert_eq!(peer.role(), RaftRole::Follower);
        assert_eq!(peer.current_term(), TermId::new(0));
        assert!(peer.leader_id().is_none());
    }

    #[test]
    fn test_election_timeout_starts_election() {
        let mut peer = RaftPeer::new(make_config(1));

        let outputs = peer.handle_election_timeout();

        assert_eq!(peer.role(), RaftRole::Candidate);
        assert_eq!(peer.current_term(), TermId::new(1));

        let vote_requests: Vec<_> = outputs
            .iter()
            .filter(|o| matches!(o, RaftOutput::SendMessage(Message::RequestVote(_))))
            .collect();
        assert_eq!(vote_requests.len(), 2);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::PersistState(_))));
    }

    #[test]
    fn test_randomised_timeout_within_window() {
        let mut peer = RaftPeer::new(make_config(1));
        let outputs = peer.handle_election_timeout();

        let timeout = outputs.iter().find_map(|o| match o {
            RaftOutput::ResetElectionTimer(t) => Some(*t),
            _ => None,
        });
        let timeout = timeout.unwrap();
        assert!(timeout >= Duration::from_millis(150));
        assert!(timeout <= Duration::from_millis(300));
    }

    #[test]
    fn test_vote_granted_on_valid_request() {
        let mut peer = RaftPeer::new(make_config(1));

        let request = RequestVoteRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        );
        let outputs = peer.handle_message(Message::RequestVote(request));

        let response = outputs.iter().find_map(|o| match o {
            RaftOutput::SendMessage(Message::RequestVoteResponse(r)) => Some(r),
            _ => None,
        });
        assert!(response.unwrap().vote_granted);
    }

    #[test]
    fn test_vote_not_granted_if_already_voted() {
        let mut peer = RaftPeer::new(make_config(1));

        let request1 = RequestVoteRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        );
        peer.handle_message(Message::RequestVote(request1));

        // A second candidate in the same term is refused.
        let request2 = RequestVoteRequest::new(
            TermId::new(1),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        );
        let outputs = peer.handle_message(Message::RequestVote(request2));

        let response = outputs.iter().find_map(|o| match o {
            RaftOutput::SendMessage(Message::RequestVoteResponse(r)) => Some(r),
            _ => None,
        });
        assert!(!response.unwrap().vote_granted);
    }

    #[test]
    fn test_vote_refused_for_stale_log() {
        let mut peer = RaftPeer::new(make_config(1));
        // Give this peer a log entry at term 2.
        peer.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(2),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            vec![LogEntry::new(TermId::new(2), LogIndex::new(1), delta(1))],
            LogIndex::new(0),
        )));

        // A candidate with an older log must not win our vote.
        let request = RequestVoteRequest::new(
            TermId::new(3),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
        );
        let outputs = peer.handle_message(Message::RequestVote(request));
        let response = outputs.iter().find_map(|o| match o {
            RaftOutput::SendMessage(Message::RequestVoteResponse(r)) => Some(r),
            _ => None,
        });
        assert!(!response.unwrap().vote_granted);
    }

    #[test]
    fn test_becomes_leader_with_quorum() {
        let mut peer = RaftPeer::new(make_config(1));

        peer.handle_election_timeout();
        assert_eq!(peer.role(), RaftRole::Candidate);

        let vote = RequestVoteResponse::new(TermId::new(1), NodeId::new(2), NodeId::new(1), true);
        let outputs = peer.handle_message(Message::RequestVoteResponse(vote));

        // Two votes (self + peer 2) reach quorum in a group of three.
        assert_eq!(peer.role(), RaftRole::Leader);
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::BecameLeader)));
    }

    #[test]
    fn test_append_entries_resets_election_timer() {
        let mut peer = RaftPeer::new(make_config(1));

        let request = AppendEntriesRequest::heartbeat(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            LogIndex::new(0),
        );
        let outputs = peer.handle_message(Message::AppendEntries(request));

        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::ResetElectionTimer(_))));
        assert_eq!(peer.leader_id(), Some(NodeId::new(2)));
    }

    #[test]
    fn test_propose_appends_to_log() {
        let mut peer = RaftPeer::new(make_config(1));

        peer.handle_election_timeout();
        let vote = RequestVoteResponse::new(TermId::new(1), NodeId::new(2), NodeId::new(1), true);
        peer.handle_message(Message::RequestVoteResponse(vote));
        assert!(peer.is_leader());

        let (index, _outputs) = peer.propose(delta(1)).unwrap();
        assert_eq!(index, LogIndex::new(1));
        assert_eq!(peer.log().len(), 1);
    }

    #[test]
    fn test_propose_on_follower_is_refused() {
        let mut peer = RaftPeer::new(make_config(1));
        assert!(peer.propose(delta(1)).is_none());
    }

    #[test]
    fn test_step_down_on_higher_term() {
        let mut peer = RaftPeer::new(make_config(1));

        peer.handle_election_timeout();
        let vote = RequestVoteResponse::new(TermId::new(1), NodeId::new(2), NodeId::new(1), true);
        peer.handle_message(Message::RequestVoteResponse(vote));
        assert!(peer.is_leader());

        let request = AppendEntriesRequest::heartbeat(
            TermId::new(5),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            LogIndex::new(0),
        );
        let outputs = peer.handle_message(Message::AppendEntries(request));

        assert_eq!(peer.role(), RaftRole::Follower);
        assert_eq!(peer.current_term(), TermId::new(5));
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::SteppedDown)));
    }

    #[test]
    fn test_single_peer_group_commits_immediately() {
        let config = RaftConfig::new(NodeId::new(1), vec![NodeId::new(1)]);
        let mut peer = RaftPeer::new(config);

        let outputs = peer.handle_election_timeout();
        assert!(peer.is_leader());
        assert!(outputs.iter().any(|o| matches!(o, RaftOutput::BecameLeader)));

        let (_, outputs) = peer.propose(delta(1)).unwrap();
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry { .. })));
        assert_eq!(peer.commit_index(), LogIndex::new(1));
    }

    #[test]
    fn test_commit_requires_current_term_entry() {
        let mut peer = RaftPeer::new(make_config(1));

        // Receive an entry from term 1 as follower.
        peer.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            vec![LogEntry::new(TermId::new(1), LogIndex::new(1), delta(1))],
            LogIndex::new(0),
        )));

        // Win an election for term 2.
        peer.handle_election_timeout();
        peer.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(2),
            NodeId::new(2),
            NodeId::new(1),
            true,
        )));
        assert!(peer.is_leader());

        // Follower 2 acknowledges the old entry; it must not commit on its
        // own because its term is not the current term.
        let outputs = peer.handle_message(Message::AppendEntriesResponse(
            AppendEntriesResponse::new(
                TermId::new(2),
                NodeId::new(2),
                NodeId::new(1),
                true,
                LogIndex::new(1),
            ),
        ));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry { .. })));
        assert_eq!(peer.commit_index(), LogIndex::new(0));
    }

    #[test]
    fn test_follower_applies_in_leader_commit_order() {
        let mut peer = RaftPeer::new(make_config(1));

        let entries = vec![
            LogEntry::new(TermId::new(1), LogIndex::new(1), delta(1)),
            LogEntry::new(TermId::new(1), LogIndex::new(2), delta(2)),
        ];
        let outputs = peer.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            entries,
            LogIndex::new(2),
        )));

        let commits: Vec<u64> = outputs
            .iter()
            .filter_map(|o| match o {
                RaftOutput::CommitEntry { index, .. } => Some(index.get()),
                _ => None,
            })
            .collect();
        assert_eq!(commits, vec![1, 2]);
        assert_eq!(peer.last_applied(), LogIndex::new(2));
    }

    #[test]
    fn test_conflicting_suffix_is_replaced() {
        let mut peer = RaftPeer::new(make_config(1));

        // Old leader appends two entries at term 1.
        peer.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            vec![
                LogEntry::new(TermId::new(1), LogIndex::new(1), delta(1)),
                LogEntry::new(TermId::new(1), LogIndex::new(2), delta(2)),
            ],
            LogIndex::new(0),
        )));

        // New leader at term 2 overwrites index 2.
        peer.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(2),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(1),
            TermId::new(1),
            vec![LogEntry::new(TermId::new(2), LogIndex::new(2), delta(9))],
            LogIndex::new(0),
        )));

        assert_eq!(peer.log().term_at(LogIndex::new(2)), TermId::new(2));
        assert_eq!(peer.log().len(), 2);
    }

    #[test]
    fn test_restore_persistent_state() {
        let mut peer = RaftPeer::new(make_config(1));
        let state = PersistentState {
            current_term: TermId::new(7),
            voted_for: Some(NodeId::new(3)),
        };

        peer.restore(&state);

        assert_eq!(peer.current_term(), TermId::new(7));
        assert_eq!(peer.persistent_state(), state);
    }
}
