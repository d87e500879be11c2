//! Snapshot creation, automatic log compaction, and InstallSnapshot
//! handling on both sides.

use crate::core::RaftCore;
use crate::core::SnapshotBuffer;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::storage::SnapshotMeta;
use crate::wire::Message;
use crate::MessageSummary;
use crate::NodeId;
use crate::StateMachine;
use crate::Transport;

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Snapshot the state machine at `last_applied` and compact the log.
    ///
    /// The snapshot file is written first (temp + fsync + rename); only
    /// then is the log prefix dropped, in memory and on disk. A crash
    /// between the two steps leaves a log that merely overlaps the
    /// snapshot, which recovery reconciles.
    pub(crate) fn create_snapshot(&mut self) -> RaftResult<Option<SnapshotMeta>> {
        if !self.started || self.target_state.is_shutdown() {
            return Err(RaftError::Stopped);
        }
        // Nothing applied, or nothing new since the last snapshot.
        if self.last_applied == 0 || self.last_applied <= self.snapshot_last.last_index {
            return Ok(None);
        }
        let state = match self.machine.snapshot()? {
            Some(state) => state,
            None => return Ok(None),
        };

        let last_index = self.last_applied;
        let meta = SnapshotMeta {
            last_index,
            last_term: self.log.term_at(last_index),
        };

        if let Some(store) = &mut self.store {
            store.save_snapshot(&meta, &state)?;
        }

        self.log.truncate_before(last_index + 1);
        if let Some(store) = &mut self.store {
            let remaining: Vec<Entry> = self.log.entries_from(self.log.base_index() + 1, u64::MAX).to_vec();
            store.compact_log(self.log.base_index(), self.log.base_term(), &remaining)?;
        }
        self.snapshot_last = meta;

        tracing::info!(
            id = self.id,
            last_index = meta.last_index,
            last_term = meta.last_term,
            "created snapshot and compacted log"
        );
        Ok(Some(meta))
    }

    /// Compact automatically once enough entries accumulate past the last
    /// snapshot. No-ops when compaction is disabled, nothing has been
    /// applied, or the machine does not produce snapshots.
    pub(super) fn maybe_auto_compact(&mut self) -> RaftResult<()> {
        let threshold = self.config.auto_compaction_threshold;
        if threshold == 0 || self.last_applied == 0 {
            return Ok(());
        }
        if self.last_applied.saturating_sub(self.snapshot_last.last_index) > threshold {
            self.create_snapshot()?;
        }
        Ok(())
    }

    /// Handle an InstallSnapshot RPC (§7).
    ///
    /// Chunks must arrive in order from offset 0; an out-of-place chunk
    /// drops the partial transfer and waits for the leader to restart it.
    /// The single-chunk case (`offset == 0 && done`) is the fast path.
    pub(super) fn handle_install_snapshot(&mut self, from: NodeId, req: InstallSnapshotRequest) -> RaftResult<()> {
        tracing::debug!(id = self.id, from, req = %req.summary(), "handling install snapshot");
        self.observe_term(req.term)?;

        if req.term < self.current_term {
            self.respond_snapshot(from);
            return Ok(());
        }
        if self.target_state.is_leader() {
            tracing::error!(id = self.id, from, term = req.term, "install snapshot from another leader in our term");
            return Ok(());
        }

        self.note_leader_contact(req.leader_id);
        if self.target_state.is_candidate() || self.target_state.is_pre_candidate() {
            self.become_follower();
        }

        if req.offset == 0 {
            self.snapshot_buffer = Some(SnapshotBuffer {
                last_index: req.last_index,
                last_term: req.last_term,
                data: req.data,
            });
        } else {
            match &mut self.snapshot_buffer {
                Some(buffer)
                    if buffer.last_index == req.last_index
                        && buffer.last_term == req.last_term
                        && buffer.data.len() as u64 == req.offset =>
                {
                    buffer.data.extend_from_slice(&req.data);
                }
                _ => {
                    // Out of order; drop the partial transfer.
                    tracing::debug!(id = self.id, offset = req.offset, "discarding out-of-order snapshot chunk");
                    self.snapshot_buffer = None;
                    self.respond_snapshot(from);
                    return Ok(());
                }
            }
        }

        if req.done {
            if let Some(buffer) = self.snapshot_buffer.take() {
                // A snapshot that does not reach past our log base carries
                // nothing we do not already have.
                if buffer.last_index > self.log.base_index() {
                    self.install_snapshot_buffer(buffer)?;
                }
            }
        }

        self.respond_snapshot(from);
        Ok(())
    }

    /// Replace log and state machine with a fully received snapshot.
    fn install_snapshot_buffer(&mut self, buffer: SnapshotBuffer) -> RaftResult<()> {
        let meta = SnapshotMeta {
            last_index: buffer.last_index,
            last_term: buffer.last_term,
        };
        tracing::info!(id = self.id, last_index = meta.last_index, last_term = meta.last_term, "installing snapshot");

        if let Some(store) = &mut self.store {
            store.save_snapshot(&meta, &buffer.data)?;
            store.reset_log(meta.last_index, meta.last_term)?;
        }
        self.machine.restore(&buffer.data)?;

        self.log.reset(meta.last_index, meta.last_term);
        self.snapshot_last = meta;
        self.commit_index = self.commit_index.max(meta.last_index);
        self.last_applied = self.last_applied.max(meta.last_index);

        // A pending config change whose entry the snapshot covers has by
        // definition committed; take it now, its entry is gone.
        if let Some(pending) = self.membership.pending {
            if pending.index <= meta.last_index {
                self.membership.apply(&pending.change);
            }
        }
        Ok(())
    }

    /// Ship our snapshot to a peer whose `next_index` has been compacted
    /// away. Sent as a single chunk.
    pub(super) fn send_snapshot_to(&mut self, peer: NodeId) -> RaftResult<()> {
        let (meta, data) = match &self.store {
            Some(store) => match store.load_snapshot()? {
                Some(pair) => pair,
                None => return Ok(()),
            },
            None => {
                // Memory-only nodes snapshot on demand.
                let data = match self.machine.snapshot()? {
                    Some(data) => data,
                    None => return Ok(()),
                };
                let last_index = self.last_applied;
                (
                    SnapshotMeta {
                        last_index,
                        last_term: self.log.term_at(last_index),
                    },
                    data,
                )
            }
        };
        if meta.last_index == 0 {
            return Ok(());
        }

        if let Some(leader) = &mut self.leader {
            if let Some(progress) = leader.replication.get_mut(&peer) {
                progress.pending_snapshot = Some(meta.last_index);
            }
        }

        tracing::info!(id = self.id, peer, last_index = meta.last_index, "sending snapshot");
        let req = InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id,
            last_index: meta.last_index,
            last_term: meta.last_term,
            offset: 0,
            done: true,
            data,
        };
        self.send_message(peer, &Message::InstallSnapshot(req));
        Ok(())
    }

    /// Handle a response to one of our InstallSnapshot frames.
    pub(super) fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        resp: InstallSnapshotResponse,
    ) -> RaftResult<()> {
        self.observe_term(resp.term)?;
        if !self.target_state.is_leader() || resp.term != self.current_term {
            return Ok(());
        }

        let covered = match self.leader.as_mut().and_then(|l| l.replication.get_mut(&from)) {
            Some(progress) => match progress.pending_snapshot.take() {
                Some(covered) => {
                    progress.match_index = progress.match_index.max(covered);
                    progress.next_index = covered + 1;
                    covered
                }
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        tracing::debug!(id = self.id, from, covered, "snapshot installed on peer");
        self.record_read_ack(from);
        self.leader_advance_commit()?;
        if self.target_state.is_leader() {
            self.send_append_to(from)?;
        }
        Ok(())
    }

    fn respond_snapshot(&self, to: NodeId) {
        self.send_message(
            to,
            &Message::InstallSnapshotResp(InstallSnapshotResponse {
                term: self.current_term,
            }),
        );
    }
}
