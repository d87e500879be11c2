//! Leader-side replication: shipping entries to peers, processing their
//! responses, and advancing the commit index on majority match.

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::wire::Message;
use crate::NodeId;
use crate::StateMachine;
use crate::Transport;

/// What to do with a peer after bookkeeping its response.
enum PeerAction {
    /// Response consumed; progress recorded up to the carried match index.
    Progressed(u64),
    /// Prefixes diverge; resend from the rewound `next_index`.
    Resend,
    /// The peer's `next_index` fell below the log base; only a snapshot
    /// can repair it.
    NeedsSnapshot,
}

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Send an AppendEntries frame to every peer.
    ///
    /// Serves as both the heartbeat and the retry path: peers that are
    /// caught up receive an empty frame, peers that lag receive their next
    /// batch of entries.
    pub(super) fn replicate_to_all(&mut self) -> RaftResult<()> {
        if !self.target_state.is_leader() {
            return Ok(());
        }
        let peers: Vec<NodeId> = match &self.leader {
            Some(leader) => leader.replication.keys().copied().collect(),
            None => return Ok(()),
        };
        for peer in peers {
            self.send_append_to(peer)?;
        }
        Ok(())
    }

    /// Send one AppendEntries frame to `peer`, or a snapshot when the
    /// peer's next index has been compacted away.
    pub(super) fn send_append_to(&mut self, peer: NodeId) -> RaftResult<()> {
        let next_index = match self.leader.as_ref().and_then(|l| l.replication.get(&peer)) {
            Some(progress) => progress.next_index,
            None => return Ok(()),
        };

        if next_index <= self.log.base_index() {
            return self.send_snapshot_to(peer);
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index);
        let entries: Vec<Entry> = self.log.entries_from(next_index, self.config.max_entries_per_append).to_vec();

        let req = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        };
        self.send_message(peer, &Message::AppendEntries(req));
        Ok(())
    }

    /// Handle a response to one of our AppendEntries frames.
    pub(super) fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> RaftResult<()> {
        self.observe_term(resp.term)?;

        // Stale responses from earlier terms or from before we lost
        // leadership carry no information.
        if !self.target_state.is_leader() || resp.term != self.current_term {
            return Ok(());
        }

        let last_index = self.log.last_index();
        let base_index = self.log.base_index();

        let action = {
            let leader = self.leader.as_mut().expect("leader state present while Leader");
            let progress = match leader.replication.get_mut(&from) {
                Some(progress) => progress,
                None => return Ok(()),
            };

            if resp.success {
                // match_index only moves forward; duplicated or reordered
                // responses are filtered here.
                let matched = resp.match_index.min(last_index);
                if matched > progress.match_index {
                    progress.match_index = matched;
                }
                progress.next_index = progress.match_index + 1;
                PeerAction::Progressed(progress.match_index)
            } else {
                // The follower replied with its last log index; rewinding
                // straight to it converges in one round instead of one
                // index per round.
                let hint_next = resp.match_index.saturating_add(1);
                progress.next_index = progress.next_index.saturating_sub(1).min(hint_next).max(1);
                if progress.next_index <= base_index {
                    PeerAction::NeedsSnapshot
                } else {
                    PeerAction::Resend
                }
            }
        };

        match action {
            PeerAction::Progressed(matched) => {
                self.record_read_ack(from);
                self.maybe_progress_transfer(from, matched);
                self.leader_advance_commit()?;

                // Keep feeding a peer that is still behind.
                if self.target_state.is_leader() {
                    let next_index = self.leader.as_ref().and_then(|l| l.replication.get(&from)).map(|p| p.next_index);
                    if let Some(next_index) = next_index {
                        if next_index <= self.log.last_index() {
                            self.send_append_to(from)?;
                        }
                    }
                }
            }
            PeerAction::Resend => self.send_append_to(from)?,
            PeerAction::NeedsSnapshot => self.send_snapshot_to(from)?,
        }
        Ok(())
    }

    /// Advance the commit index to the highest current-term entry held by a
    /// strict majority of the voting set (§5.3, §5.4.2).
    ///
    /// Entries from earlier terms are never counted directly; they commit
    /// transitively when a current-term entry above them reaches a
    /// majority.
    pub(super) fn leader_advance_commit(&mut self) -> RaftResult<()> {
        if !self.target_state.is_leader() {
            return Ok(());
        }

        let majority = self.membership.majority_size();
        let voting = self.membership.voting_members();

        let mut candidate_index = self.log.last_index();
        while candidate_index > self.commit_index {
            let term = self.log.term_at(candidate_index);
            // Terms are monotonic within the log: below the first
            // older-term entry nothing can be from the current term.
            if term < self.current_term {
                break;
            }
            if term == self.current_term {
                let mut count = if voting.contains(&self.id) { 1 } else { 0 };
                if let Some(leader) = &self.leader {
                    for (peer, progress) in &leader.replication {
                        if voting.contains(peer) && progress.match_index >= candidate_index {
                            count += 1;
                        }
                    }
                }
                if count >= majority {
                    tracing::debug!(id = self.id, commit_index = candidate_index, "advancing commit index");
                    return self.update_commit(candidate_index);
                }
            }
            candidate_index -= 1;
        }
        Ok(())
    }
}
