//! Election logic: RequestVote, PreVote, and the transitions they drive.

use std::collections::BTreeMap;

use crate::core::CandidateState;
use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::ReplicationState;
use crate::core::State;
use crate::error::RaftResult;
use crate::raft::EntryKind;
use crate::raft::PreVoteRequest;
use crate::raft::PreVoteResponse;
use crate::raft::TimeoutNow;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::wire::Message;
use crate::MessageSummary;
use crate::NodeId;
use crate::StateMachine;
use crate::Transport;

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// The election timer fired while not Leader.
    pub(super) fn handle_election_timeout(&mut self) -> RaftResult<()> {
        match self.target_state {
            State::Follower => {
                if self.config.prevote_enabled {
                    self.start_prevote()
                } else {
                    self.start_election()
                }
            }
            // A PreVote round that never gathered a majority goes back to
            // waiting; the next timeout tries again.
            State::PreCandidate => {
                self.become_follower();
                Ok(())
            }
            // A split vote: campaign again in a fresh term.
            State::Candidate => self.start_election(),
            State::Leader | State::Shutdown => Ok(()),
        }
    }

    /// Begin a PreVote round for `current_term + 1`.
    ///
    /// No term or vote is touched anywhere: a round that fails leaves the
    /// whole cluster exactly as it was.
    pub(super) fn start_prevote(&mut self) -> RaftResult<()> {
        if !self.membership.contains(&self.id) {
            self.reset_election_timer();
            return Ok(());
        }

        tracing::debug!(id = self.id, term = self.current_term, "starting prevote round");
        let mut state = CandidateState::default();
        state.prevotes_granted.insert(self.id);
        self.candidate = Some(state);
        self.target_state = State::PreCandidate;
        self.reset_election_timer();

        if self.prevotes_granted() >= self.membership.majority_size() {
            return self.start_election();
        }

        let req = PreVoteRequest {
            term: self.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.voting_peers() {
            self.send_message(peer, &Message::PreVote(req.clone()));
        }
        Ok(())
    }

    /// Begin a real election: bump the term, vote for self, solicit votes.
    pub(super) fn start_election(&mut self) -> RaftResult<()> {
        if !self.membership.contains(&self.id) {
            self.reset_election_timer();
            return Ok(());
        }

        let term = self.current_term + 1;
        tracing::info!(id = self.id, term, "starting election");

        // Term and self-vote must be durable before any peer can observe
        // them through the vote requests below.
        self.set_hard_state(term, Some(self.id))?;
        let mut state = CandidateState::default();
        state.votes_granted.insert(self.id);
        self.candidate = Some(state);
        self.target_state = State::Candidate;
        self.current_leader = None;
        self.reset_election_timer();

        if self.votes_granted() >= self.membership.majority_size() {
            return self.become_leader();
        }

        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.voting_peers() {
            self.send_message(peer, &Message::RequestVote(req.clone()));
        }
        Ok(())
    }

    /// Handle a RequestVote RPC (§5.2).
    pub(super) fn handle_vote_request(&mut self, from: NodeId, req: VoteRequest) -> RaftResult<()> {
        tracing::debug!(id = self.id, from, req = %req.summary(), "handling vote request");
        self.observe_term(req.term)?;

        let grant = req.term == self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(req.candidate_id))
            && self.candidate_up_to_date(req.last_log_index, req.last_log_term);

        if grant {
            // The vote must be durable before the reply discloses it.
            self.set_hard_state(self.current_term, Some(req.candidate_id))?;
            self.reset_election_timer();
            tracing::debug!(id = self.id, candidate = req.candidate_id, term = self.current_term, "granted vote");
        }

        self.send_message(
            from,
            &Message::RequestVoteResp(VoteResponse {
                term: self.current_term,
                vote_granted: grant,
            }),
        );
        Ok(())
    }

    /// Handle a response to one of our RequestVote RPCs.
    pub(super) fn handle_vote_response(&mut self, from: NodeId, resp: VoteResponse) -> RaftResult<()> {
        self.observe_term(resp.term)?;

        // Only counts if we are still the candidate of that term.
        if !self.target_state.is_candidate() || resp.term != self.current_term {
            return Ok(());
        }

        if resp.vote_granted {
            if let Some(candidate) = &mut self.candidate {
                candidate.votes_granted.insert(from);
            }
            if self.votes_granted() >= self.membership.majority_size() {
                self.become_leader()?;
            }
        }
        Ok(())
    }

    /// Handle a PreVote RPC.
    ///
    /// Never mutates term or vote. Granted only if a real election with the
    /// requested term would be winnable from this node's point of view: the
    /// candidate's log is up to date, the term is ahead of ours, and we have
    /// not heard from a live leader recently.
    pub(super) fn handle_prevote_request(&mut self, from: NodeId, req: PreVoteRequest) -> RaftResult<()> {
        let grant = req.term >= self.current_term + 1
            && !self.target_state.is_leader()
            && self.leader_is_silent()
            && self.candidate_up_to_date(req.last_log_index, req.last_log_term);

        tracing::debug!(id = self.id, from, req = %req.summary(), grant, "handling prevote request");
        self.send_message(
            from,
            &Message::PreVoteResp(PreVoteResponse {
                term: self.current_term,
                vote_granted: grant,
            }),
        );
        Ok(())
    }

    /// Handle a response to one of our PreVote RPCs.
    pub(super) fn handle_prevote_response(&mut self, from: NodeId, resp: PreVoteResponse) -> RaftResult<()> {
        self.observe_term(resp.term)?;

        if !self.target_state.is_pre_candidate() {
            return Ok(());
        }

        if resp.vote_granted {
            if let Some(candidate) = &mut self.candidate {
                candidate.prevotes_granted.insert(from);
            }
            if self.prevotes_granted() >= self.membership.majority_size() {
                return self.start_election();
            }
        } else {
            // Someone sees a leader or a longer log; stand down and let the
            // next timeout try again.
            self.become_follower();
        }
        Ok(())
    }

    /// Handle a TimeoutNow from the leader: campaign immediately, skipping
    /// both the randomized wait and PreVote (§3.10 of the Raft thesis).
    pub(super) fn handle_timeout_now(&mut self, from: NodeId, req: TimeoutNow) -> RaftResult<()> {
        self.observe_term(req.term)?;
        if req.term < self.current_term || self.target_state.is_leader() {
            return Ok(());
        }
        tracing::info!(id = self.id, from, "received timeout-now, starting election at once");
        self.start_election()
    }

    /// Assume leadership of the current term.
    pub(super) fn become_leader(&mut self) -> RaftResult<()> {
        tracing::info!(id = self.id, term = self.current_term, "becoming leader");
        self.candidate = None;
        self.target_state = State::Leader;
        self.current_leader = Some(self.id);
        self.last_leader_contact = self.clock;

        let next_index = self.log.last_index() + 1;
        let mut replication = BTreeMap::new();
        for peer in self.voting_peers() {
            replication.insert(peer, ReplicationState::new(next_index));
        }
        self.leader = Some(LeaderState {
            replication,
            pending_reads: Vec::new(),
            transfer: None,
        });
        self.heartbeat_deadline = self.clock + self.config.heartbeat_interval;

        // Entries from earlier terms cannot be counted for commitment
        // directly (§5.4.2); an empty entry in our own term commits them
        // transitively once it reaches a majority.
        if self.commit_index < self.log.last_index() {
            self.append_entry_as_leader(EntryKind::Noop, Vec::new())?;
        }

        self.replicate_to_all()?;
        self.leader_advance_commit()?;
        Ok(())
    }

    /// Whether a candidate's last log position is at least as up-to-date as
    /// ours (§5.4.1).
    fn candidate_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index())
    }

    fn votes_granted(&self) -> usize {
        self.candidate.as_ref().map(|c| c.votes_granted.len()).unwrap_or(0)
    }

    fn prevotes_granted(&self) -> usize {
        self.candidate.as_ref().map(|c| c.prevotes_granted.len()).unwrap_or(0)
    }
}
