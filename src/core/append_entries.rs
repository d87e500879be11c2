//! Follower-side handling of AppendEntries: the consistency check, conflict
//! truncation, and commit-index updates.

use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConfigChange;
use crate::raft::EntryKind;
use crate::wire::Message;
use crate::MessageSummary;
use crate::NodeId;
use crate::StateMachine;
use crate::Transport;

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Handle an AppendEntries RPC (§5.3), which doubles as the heartbeat.
    ///
    /// One rule covers both paths: the consistency check runs against
    /// `prev`, conflicting suffixes are truncated, missing entries are
    /// appended, and the commit index advances to
    /// `min(leader_commit, last position confirmed by this request)`.
    pub(super) fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) -> RaftResult<()> {
        tracing::trace!(id = self.id, from, req = %req.summary(), "handling append entries");
        self.observe_term(req.term)?;

        if req.term < self.current_term {
            self.respond_append(from, false);
            return Ok(());
        }

        if self.target_state.is_leader() {
            // Two leaders in one term would break election safety; nothing
            // sane can be done with such a request.
            tracing::error!(id = self.id, from, term = req.term, "append entries from another leader in our term");
            return Ok(());
        }

        // A valid request from the leader of our term.
        self.note_leader_contact(req.leader_id);
        if self.target_state.is_candidate() || self.target_state.is_pre_candidate() {
            self.become_follower();
        }

        // Incoming entries must form a contiguous run right after `prev`.
        for (i, entry) in req.entries.iter().enumerate() {
            let expected = req.prev_log_index + 1 + i as u64;
            if entry.index != expected {
                return Err(RaftError::Corruption(format!(
                    "append entries not contiguous: expected index {}, found {}",
                    expected, entry.index
                )));
            }
        }

        // Consistency check (§5.3). Positions at or below the log base are
        // covered by the snapshot and thus known to match.
        if req.prev_log_index > self.log.base_index()
            && self.log.term_at(req.prev_log_index) != req.prev_log_term
        {
            tracing::debug!(
                id = self.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                local_term = self.log.term_at(req.prev_log_index),
                "consistency check failed"
            );
            self.respond_append(from, false);
            return Ok(());
        }

        // Walk the incoming entries: skip what we already hold, truncate a
        // conflicting suffix once, then append the rest.
        let mut last_new_index = req.prev_log_index;
        for entry in req.entries {
            if entry.index <= self.log.base_index() {
                last_new_index = entry.index;
                continue;
            }

            let existing_term = self.log.term_at(entry.index);
            if existing_term == entry.term {
                last_new_index = entry.index;
                continue;
            }
            if existing_term != 0 {
                if self.commit_index >= entry.index {
                    return Err(RaftError::Corruption(format!(
                        "refusing to truncate committed entry {} (commit index {})",
                        entry.index, self.commit_index
                    )));
                }
                tracing::debug!(id = self.id, from_index = entry.index, "truncating conflicting suffix");
                self.membership.revert_pending_after(entry.index - 1);
                if let Some(store) = &mut self.store {
                    store.truncate_log_after(entry.index - 1)?;
                }
                self.log.truncate_after(entry.index - 1);
            }

            if entry.kind == EntryKind::Config {
                let change = ConfigChange::decode(&entry.payload)?;
                self.membership.set_pending(change, entry.index);
            }
            if let Some(store) = &mut self.store {
                store.append_entry(&entry)?;
            }
            last_new_index = entry.index;
            self.log.append(entry);
        }

        // Only positions this request actually confirmed may be committed,
        // never the tail of a longer stale log.
        if req.leader_commit > self.commit_index {
            self.update_commit(req.leader_commit.min(last_new_index))?;
        }

        self.respond_append(from, true);
        Ok(())
    }

    /// Reply to an AppendEntries request.
    ///
    /// `match_index` carries our last log index either way: on success it
    /// tells the leader how far we match, on failure it is the hint that
    /// lets the leader rewind `next_index` in one step instead of many.
    fn respond_append(&self, to: NodeId, success: bool) {
        self.send_message(
            to,
            &Message::AppendEntriesResp(AppendEntriesResponse {
                term: self.current_term,
                success,
                match_index: self.log.last_index(),
            }),
        );
    }
}
