//! The local client API: proposals, batched proposals, manual apply, and
//! linearizable reads via ReadIndex.

use std::collections::BTreeSet;

use crate::core::PendingRead;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::ConfigChange;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::NodeId;
use crate::ReadCallback;
use crate::StateMachine;
use crate::Transport;

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Propose a command for replication. Leader only.
    pub(crate) fn propose(&mut self, cmd: Vec<u8>) -> RaftResult<u64> {
        self.ensure_accepting_proposals()?;

        let index = self.append_entry_as_leader(EntryKind::Command, cmd)?;
        tracing::debug!(id = self.id, index, "proposed command");

        self.replicate_to_all()?;
        // A single-node majority is satisfied on the spot.
        self.leader_advance_commit()?;
        Ok(index)
    }

    /// Propose a batch of commands atomically, returning the first index.
    pub(crate) fn propose_batch(&mut self, cmds: Vec<Vec<u8>>) -> RaftResult<u64> {
        self.ensure_accepting_proposals()?;
        if cmds.is_empty() {
            return Err(RaftError::InvalidArgument("batch may not be empty"));
        }

        let first_index = self.log.last_index() + 1;
        for cmd in cmds {
            if let Err(err) = self.append_entry_as_leader(EntryKind::Command, cmd) {
                // Unwind the partial batch so no prefix of it can replicate.
                if let Some(store) = &mut self.store {
                    let _ = store.truncate_log_after(first_index - 1);
                }
                self.log.truncate_after(first_index - 1);
                return Err(err);
            }
        }

        self.replicate_to_all()?;
        self.leader_advance_commit()?;
        Ok(first_index)
    }

    /// Apply up to `max` committed entries; the manual counterpart of the
    /// automatic apply pump.
    pub(crate) fn apply_batch(&mut self, max: u64) -> RaftResult<u64> {
        if !self.started || self.target_state.is_shutdown() {
            return Err(RaftError::Stopped);
        }
        if max == 0 {
            return Err(RaftError::InvalidArgument("batch size must be greater than 0"));
        }
        self.apply_ready(max)
    }

    /// Begin a linearizable read (§8).
    ///
    /// Pins the current commit index and waits for a strict majority of the
    /// voting set to acknowledge our leadership through heartbeat
    /// responses that arrive after this point. The callback fires once the
    /// majority is in and the state machine has applied up to the pinned
    /// index.
    pub(crate) fn read_index(&mut self, cb: ReadCallback) {
        if let Err(err) = self.ensure_leader() {
            cb(Err(err));
            return;
        }

        let read_index = self.commit_index;
        let mut acks = BTreeSet::new();
        acks.insert(self.id);
        let confirmed = acks.len() >= self.membership.majority_size();

        if confirmed && self.last_applied >= read_index {
            // Single-node clusters confirm themselves.
            cb(Ok(read_index));
            return;
        }

        if let Some(leader) = &mut self.leader {
            leader.pending_reads.push(PendingRead {
                read_index,
                acks,
                confirmed,
                cb: Some(cb),
            });
        }

        if !confirmed {
            // Kick off a heartbeat round rather than waiting for the timer.
            if let Err(err) = self.replicate_to_all() {
                tracing::error!(id = self.id, error = %err, "failed to send heartbeat round for read");
            }
        }
    }

    /// Count a successful heartbeat response toward every unconfirmed read.
    pub(super) fn record_read_ack(&mut self, from: NodeId) {
        let majority = self.membership.majority_size();
        if !self.membership.voting_members().contains(&from) {
            return;
        }
        if let Some(leader) = &mut self.leader {
            for read in leader.pending_reads.iter_mut().filter(|r| !r.confirmed) {
                read.acks.insert(from);
                if read.acks.len() >= majority {
                    read.confirmed = true;
                }
            }
        }
        self.complete_pending_reads();
    }

    /// Fire the callbacks of reads that are confirmed and applied.
    pub(super) fn complete_pending_reads(&mut self) {
        let last_applied = self.last_applied;
        if let Some(leader) = &mut self.leader {
            let mut i = 0;
            while i < leader.pending_reads.len() {
                let ready = leader.pending_reads[i].confirmed && leader.pending_reads[i].read_index <= last_applied;
                if ready {
                    let mut read = leader.pending_reads.remove(i);
                    if let Some(cb) = read.cb.take() {
                        cb(Ok(read.read_index));
                    }
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Assign the next index and our term to a payload, persist it, and
    /// append it to the in-memory log.
    pub(super) fn append_entry_as_leader(&mut self, kind: EntryKind, payload: Vec<u8>) -> RaftResult<u64> {
        let index = self.log.last_index() + 1;
        let entry = Entry {
            term: self.current_term,
            index,
            kind,
            payload,
        };

        // Durable before visible: a crash between these two lines loses
        // nothing the cluster could have observed.
        if let Some(store) = &mut self.store {
            store.append_entry(&entry)?;
        }
        if entry.kind == EntryKind::Config {
            let change = ConfigChange::decode(&entry.payload)?;
            self.membership.set_pending(change, index);
        }
        self.log.append(entry);
        Ok(index)
    }

    /// Proposals are rejected while not leader and during a transfer.
    fn ensure_accepting_proposals(&self) -> RaftResult<()> {
        self.ensure_leader()?;
        if self.leader.as_ref().and_then(|l| l.transfer).is_some() {
            return Err(RaftError::TransferInProgress);
        }
        Ok(())
    }
}
