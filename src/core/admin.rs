//! Administrative operations: single-step membership changes and graceful
//! leadership transfer.

use crate::core::PendingTransfer;
use crate::core::RaftCore;
use crate::core::ReplicationState;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::ConfigChange;
use crate::raft::ConfigChangeOp;
use crate::raft::EntryKind;
use crate::raft::TimeoutNow;
use crate::wire::Message;
use crate::NodeId;
use crate::StateMachine;
use crate::Transport;

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Propose adding `id` as a voting member. Leader only.
    pub(crate) fn add_node(&mut self, id: NodeId) -> RaftResult<u64> {
        self.ensure_leader()?;
        if self.membership.pending.is_some() {
            return Err(RaftError::ChangeInProgress);
        }
        if self.membership.members.contains(&id) {
            return Err(RaftError::InvalidArgument("node is already a cluster member"));
        }

        let change = ConfigChange {
            op: ConfigChangeOp::Add,
            node: id,
        };
        tracing::info!(id = self.id, node = change.node, "proposing member addition");
        // Appending the entry marks the change pending, so the new node
        // counts toward quorum from this moment on.
        let index = self.append_entry_as_leader(EntryKind::Config, change.encode())?;

        // Start replicating to it right away so it can catch up.
        let next_index = self.log.last_index() + 1;
        if let Some(leader) = &mut self.leader {
            leader.replication.entry(id).or_insert_with(|| ReplicationState::new(next_index));
        }

        self.replicate_to_all()?;
        self.leader_advance_commit()?;
        Ok(index)
    }

    /// Propose removing `id` from the voting members. Leader only.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> RaftResult<u64> {
        self.ensure_leader()?;
        if self.membership.pending.is_some() {
            return Err(RaftError::ChangeInProgress);
        }
        if !self.membership.members.contains(&id) {
            return Err(RaftError::NotFound);
        }

        let change = ConfigChange {
            op: ConfigChangeOp::Remove,
            node: id,
        };
        tracing::info!(id = self.id, node = change.node, "proposing member removal");
        let index = self.append_entry_as_leader(EntryKind::Config, change.encode())?;

        // The node being removed still counts for quorum, and still needs
        // the entry, until the change is applied; replication to it
        // continues until then.
        self.replicate_to_all()?;
        self.leader_advance_commit()?;
        Ok(index)
    }

    /// Hand leadership to `target`, or to the most caught-up peer.
    pub(crate) fn transfer_leadership(&mut self, target: Option<NodeId>) -> RaftResult<()> {
        self.ensure_leader()?;
        let leader = self.leader.as_ref().expect("leader state present while Leader");
        if leader.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }

        let target = match target {
            Some(target) => {
                if target == self.id {
                    return Err(RaftError::InvalidArgument("cannot transfer leadership to self"));
                }
                if !self.membership.contains(&target) {
                    return Err(RaftError::NotFound);
                }
                target
            }
            None => {
                let voting = self.membership.voting_members();
                leader
                    .replication
                    .iter()
                    .filter(|(peer, _)| voting.contains(*peer))
                    .max_by_key(|(_, progress)| progress.match_index)
                    .map(|(peer, _)| *peer)
                    .ok_or(RaftError::InvalidArgument("no peer to transfer leadership to"))?
            }
        };

        let deadline = self.clock + self.config.election_timeout_max;
        let caught_up = leader
            .replication
            .get(&target)
            .map(|progress| progress.match_index == self.log.last_index())
            .unwrap_or(false);

        tracing::info!(id = self.id, target, caught_up, "beginning leadership transfer");
        if let Some(leader) = &mut self.leader {
            leader.transfer = Some(PendingTransfer {
                target,
                deadline,
                timeout_sent: false,
            });
        }

        if caught_up {
            self.send_timeout_now(target);
        } else {
            // Push the remaining entries; the TimeoutNow goes out when the
            // target's match index reaches our last.
            self.replicate_to_all()?;
        }
        Ok(())
    }

    /// Called on each successful append response: fire TimeoutNow once the
    /// transfer target has fully caught up.
    pub(super) fn maybe_progress_transfer(&mut self, from: NodeId, matched: u64) {
        let last_index = self.log.last_index();
        let fire = match self.leader.as_mut().and_then(|l| l.transfer.as_mut()) {
            Some(transfer) if transfer.target == from && matched == last_index && !transfer.timeout_sent => {
                transfer.timeout_sent = true;
                true
            }
            _ => false,
        };
        if fire {
            self.send_timeout_now(from);
        }
    }

    /// Abort a transfer that made no progress within an election timeout.
    pub(super) fn check_transfer_deadline(&mut self) {
        let clock = self.clock;
        if let Some(leader) = &mut self.leader {
            if let Some(transfer) = leader.transfer {
                if clock >= transfer.deadline {
                    tracing::info!(id = self.id, target = transfer.target, "leadership transfer timed out, resuming");
                    leader.transfer = None;
                }
            }
        }
    }

    fn send_timeout_now(&self, target: NodeId) {
        tracing::info!(id = self.id, target, "sending timeout-now");
        self.send_message(
            target,
            &Message::TimeoutNow(TimeoutNow {
                term: self.current_term,
                leader_id: self.id,
            }),
        );
    }
}
