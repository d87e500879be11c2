//! Public Raft interface and data types.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::storage::SnapshotMeta;
use crate::MessageSummary;
use crate::NodeId;
use crate::ReadCallback;
use crate::StateMachine;
use crate::Transport;

/// A single Raft node.
///
/// The node is a passive object: it holds all protocol state but never acts
/// on its own. The hosting application drives it by calling
/// [`tick`](RaftNode::tick) with elapsed virtual time, feeding it received
/// frames via [`receive`](RaftNode::receive), and issuing local operations.
/// Every entry-point takes `&mut self`, which serializes all mutations per
/// node; a process may freely drive many independent nodes.
///
/// Durability: when the config carries a `data_dir`, the constructor
/// recovers the node from its durable files, and every operation that
/// changes observed safety state (term, vote, log) returns only after the
/// corresponding write has completed.
pub struct RaftNode<N: Transport, M: StateMachine> {
    core: RaftCore<N, M>,
}

impl<N: Transport, M: StateMachine> RaftNode<N, M> {
    /// Create a node, recovering durable state when `data_dir` is set.
    ///
    /// Recovery order: snapshot metadata and state bytes first, then the
    /// hard state, then the log is replayed into memory. A gap or checksum
    /// failure in any of them refuses to start the node with `Corruption`
    /// rather than serve divergent state.
    pub fn new(config: Config, transport: N, machine: M) -> RaftResult<Self> {
        Ok(RaftNode {
            core: RaftCore::new(config, transport, machine)?,
        })
    }

    /// Start the node.
    ///
    /// A node in a single-member cluster elects itself immediately; all
    /// others start as followers with a randomized election timeout.
    pub fn start(&mut self) -> RaftResult<()> {
        self.core.start()
    }

    /// Stop the node. All further mutating operations return `Stopped`.
    pub fn stop(&mut self) {
        self.core.stop();
    }

    /// Advance the node's virtual clock by `elapsed_ms` milliseconds.
    ///
    /// Fires election timeouts on followers and candidates, heartbeats on
    /// leaders, and the pending-transfer deadline.
    pub fn tick(&mut self, elapsed_ms: u64) -> RaftResult<()> {
        self.core.tick(elapsed_ms)
    }

    /// Dispatch a frame received from `from`.
    ///
    /// Any response is produced through the [`Transport`]. Malformed frames
    /// are rejected with `Corruption`.
    pub fn receive(&mut self, from: NodeId, frame: &[u8]) -> RaftResult<()> {
        self.core.receive(from, frame)
    }

    /// Propose a command for replication (§5.1). Leader only.
    ///
    /// Returns the log index assigned to the command. On a single-node
    /// cluster the command is committed and applied before this returns.
    pub fn propose(&mut self, cmd: Vec<u8>) -> RaftResult<u64> {
        self.core.propose(cmd)
    }

    /// Propose a batch of commands, returning the index of the first.
    ///
    /// The batch is atomic: if persisting any command fails, the log is
    /// truncated back to just before the batch and the error is returned.
    pub fn propose_batch(&mut self, cmds: Vec<Vec<u8>>) -> RaftResult<u64> {
        self.core.propose_batch(cmds)
    }

    /// Apply up to `max` committed entries to the state machine.
    ///
    /// Only meaningful with `auto_apply` disabled in the config; returns the
    /// number of entries applied.
    pub fn apply_batch(&mut self, max: u64) -> RaftResult<u64> {
        self.core.apply_batch(max)
    }

    /// Begin a linearizable read (§8). Leader only.
    ///
    /// The callback is invoked with the pinned read index once a majority
    /// of the cluster has confirmed this node's leadership and the state
    /// machine has caught up to that index, or with `NotLeader` if
    /// leadership is lost first. Single-node clusters complete immediately.
    pub fn read_index(&mut self, cb: impl FnOnce(RaftResult<u64>) + Send + 'static) {
        self.core.read_index(Box::new(cb) as ReadCallback);
    }

    /// Transfer leadership to `target`, or to the most caught-up peer.
    ///
    /// The transfer aborts and normal operation resumes if the target does
    /// not win an election within one election timeout.
    pub fn transfer_leadership(&mut self, target: Option<NodeId>) -> RaftResult<()> {
        self.core.transfer_leadership(target)
    }

    /// Propose adding `id` as a voting member (§6). Leader only.
    ///
    /// Returns the index of the config entry. At most one membership change
    /// may be in flight; further changes are rejected with
    /// `ChangeInProgress` until this one is applied.
    pub fn add_node(&mut self, id: NodeId) -> RaftResult<u64> {
        self.core.add_node(id)
    }

    /// Propose removing `id` from the voting members (§6). Leader only.
    ///
    /// A leader that removes itself steps down once the entry is applied;
    /// transferring leadership away first is recommended.
    pub fn remove_node(&mut self, id: NodeId) -> RaftResult<u64> {
        self.core.remove_node(id)
    }

    /// Snapshot the state machine and compact the log now. Requires a
    /// machine that supports snapshots; no-ops when nothing is applied yet.
    pub fn create_snapshot(&mut self) -> RaftResult<Option<SnapshotMeta>> {
        self.core.create_snapshot()
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.core.id()
    }

    /// This node's current role.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// The current term.
    pub fn current_term(&self) -> u64 {
        self.core.current_term()
    }

    /// The ID of the current leader, if known.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.core.current_leader()
    }

    /// The highest log index known to be committed.
    pub fn commit_index(&self) -> u64 {
        self.core.commit_index()
    }

    /// The highest log index applied to the state machine.
    pub fn last_applied(&self) -> u64 {
        self.core.last_applied()
    }

    /// The index of the last entry in the log.
    pub fn last_log_index(&self) -> u64 {
        self.core.last_log_index()
    }

    /// A point-in-time snapshot of the node's observable state.
    pub fn metrics(&self) -> RaftMetrics {
        self.core.metrics()
    }

    /// Borrow the state machine, e.g. to serve reads.
    pub fn state_machine(&self) -> &M {
        self.core.state_machine()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
///
/// Immutable once replicated to a majority. Indices are 1-based and
/// contiguous within a log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was created.
    pub term: u64,
    /// The entry's position in the log.
    pub index: u64,
    /// What the payload holds.
    pub kind: EntryKind,
    /// The opaque command bytes; empty for `Noop`.
    pub payload: Vec<u8>,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}-{}:{:?}", self.term, self.index, self.kind)
    }
}

/// Log entry payload variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An application command, applied via the state machine.
    Command,
    /// A membership change, applied by the node itself.
    Config,
    /// An empty entry appended by a new leader to commit prior-term entries.
    Noop,
}

impl EntryKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Config => 1,
            EntryKind::Noop => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryKind::Command),
            1 => Some(EntryKind::Config),
            2 => Some(EntryKind::Noop),
            _ => None,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The operation carried by a `Config` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChangeOp {
    /// Add a voting member.
    Add,
    /// Remove a voting member.
    Remove,
}

/// A single-step membership change, the payload of a `Config` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub op: ConfigChangeOp,
    pub node: NodeId,
}

impl ConfigChange {
    /// Encode as a `Config` entry payload: `op (u8) ++ node_id (u32)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(match self.op {
            ConfigChangeOp::Add => 1,
            ConfigChangeOp::Remove => 2,
        });
        buf.extend_from_slice(&self.node.to_le_bytes());
        buf
    }

    /// Decode a `Config` entry payload.
    pub fn decode(payload: &[u8]) -> RaftResult<Self> {
        if payload.len() != 5 {
            return Err(RaftError::Corruption("config entry payload length mismatch".into()));
        }
        let op = match payload[0] {
            1 => ConfigChangeOp::Add,
            2 => ConfigChangeOp::Remove,
            other => {
                return Err(RaftError::Corruption(format!("unknown config change op {}", other)));
            }
        };
        let node = NodeId::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        Ok(ConfigChange { op, node })
    }
}

/// A membership change that has been appended but not yet applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// The change itself.
    pub change: ConfigChange,
    /// The log index of the config entry carrying it.
    pub index: u64,
}

/// The membership configuration of the cluster.
///
/// A flat set of voting members plus at most one pending single-step change.
/// For quorum purposes a pending add counts as voting immediately, while a
/// pending remove keeps counting until its entry is applied.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All voting members of the Raft cluster.
    pub members: BTreeSet<NodeId>,
    /// The membership change in flight, if any.
    pub pending: Option<PendingChange>,
}

impl ClusterConfig {
    /// Create the initial config from a member set.
    pub fn new_initial(members: BTreeSet<NodeId>) -> Self {
        ClusterConfig {
            members,
            pending: None,
        }
    }

    /// Check if the given node is a voting member.
    ///
    /// A pending add already counts; a pending remove still counts.
    pub fn contains(&self, id: &NodeId) -> bool {
        if self.members.contains(id) {
            return true;
        }
        matches!(
            self.pending,
            Some(PendingChange {
                change: ConfigChange {
                    op: ConfigChangeOp::Add,
                    node,
                },
                ..
            }) if node == *id
        )
    }

    /// The current voting set, including a pending add.
    pub fn voting_members(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(PendingChange {
            change:
                ConfigChange {
                    op: ConfigChangeOp::Add,
                    node,
                },
            ..
        }) = self.pending
        {
            all.insert(node);
        }
        all
    }

    /// The number of votes forming a strict majority of the voting set.
    pub fn majority_size(&self) -> usize {
        self.voting_members().len() / 2 + 1
    }

    /// Record a change as pending at the given log index.
    pub(crate) fn set_pending(&mut self, change: ConfigChange, index: u64) {
        self.pending = Some(PendingChange { change, index });
    }

    /// Drop a pending change whose entry was truncated away.
    pub(crate) fn revert_pending_after(&mut self, after: u64) {
        if let Some(pending) = &self.pending {
            if pending.index > after {
                self.pending = None;
            }
        }
    }

    /// Apply a committed config entry, mutating the voter set.
    pub(crate) fn apply(&mut self, change: &ConfigChange) {
        match change.op {
            ConfigChangeOp::Add => {
                self.members.insert(change.node);
            }
            ConfigChangeOp::Remove => {
                self.members.remove(&change.node);
            }
        }
        self.pending = None;
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a
/// heartbeat (§5.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The log index immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// The new log entries to store.
    ///
    /// Empty for heartbeats; bounded by `max_entries_per_append` otherwise.
    pub entries: Vec<Entry>,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev={}:{}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower contained an entry matching `prev_log_index`
    /// and `prev_log_term`.
    pub success: bool,
    /// On success, the follower's last log index. On failure, a hint the
    /// leader uses to rewind `next_index` faster than one step at a time.
    pub match_index: u64,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// True if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// A term-neutral dry-run vote request, sent before a real election when
/// PreVote is enabled.
///
/// Carries `current_term + 1` — the term the candidate would campaign with.
/// Handling a PreVote never mutates the receiver's term or vote, so a
/// partitioned node cannot disrupt a healthy leader by pumping terms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreVoteRequest {
    /// The term the candidate would start a real election with.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for PreVoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `PreVoteRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreVoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// True if a real election with the requested term would get this
    /// node's vote.
    pub vote_granted: bool,
}

/// An RPC sent by the leader to ship a snapshot to a follower whose log is
/// too far behind to repair with AppendEntries (§7).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The last log index covered by the snapshot.
    pub last_index: u64,
    /// The term of that entry.
    pub last_term: u64,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// True for the final chunk.
    pub done: bool,
    /// The raw snapshot bytes starting at `offset`.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last={}:{}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.last_term,
            self.last_index,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for the leader to update itself.
    pub term: u64,
}

/// A leader-issued hint instructing the target to start an election
/// immediately, skipping the randomized wait. Used for leadership transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNow {
    /// The sending leader's current term.
    pub term: u64,
    /// The sending leader's ID.
    pub leader_id: NodeId,
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn config_change_payload_round_trip() {
        for change in [
            ConfigChange {
                op: ConfigChangeOp::Add,
                node: 4,
            },
            ConfigChange {
                op: ConfigChangeOp::Remove,
                node: 2,
            },
        ]
        .iter()
        {
            let decoded = ConfigChange::decode(&change.encode()).unwrap();
            assert_eq!(decoded, *change);
        }

        assert!(ConfigChange::decode(&[]).is_err());
        assert!(ConfigChange::decode(&[9, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn pending_add_counts_toward_quorum() {
        let mut config = ClusterConfig::new_initial(btreeset![1, 2, 3]);
        assert_eq!(config.majority_size(), 2);

        config.set_pending(
            ConfigChange {
                op: ConfigChangeOp::Add,
                node: 4,
            },
            5,
        );
        assert!(config.contains(&4));
        assert_eq!(config.voting_members(), btreeset![1, 2, 3, 4]);
        assert_eq!(config.majority_size(), 3);

        config.apply(&ConfigChange {
            op: ConfigChangeOp::Add,
            node: 4,
        });
        assert_eq!(config.members, btreeset![1, 2, 3, 4]);
        assert!(config.pending.is_none());
    }

    #[test]
    fn pending_remove_counts_until_applied() {
        let mut config = ClusterConfig::new_initial(btreeset![1, 2, 3]);
        config.set_pending(
            ConfigChange {
                op: ConfigChangeOp::Remove,
                node: 3,
            },
            5,
        );
        assert!(config.contains(&3));
        assert_eq!(config.majority_size(), 2);

        config.apply(&ConfigChange {
            op: ConfigChangeOp::Remove,
            node: 3,
        });
        assert_eq!(config.members, btreeset![1, 2]);
        assert!(!config.contains(&3));
    }

    #[test]
    fn truncation_reverts_pending_change() {
        let mut config = ClusterConfig::new_initial(btreeset![1, 2, 3]);
        config.set_pending(
            ConfigChange {
                op: ConfigChangeOp::Add,
                node: 4,
            },
            7,
        );

        config.revert_pending_after(7);
        assert!(config.pending.is_some());

        config.revert_pending_after(6);
        assert!(config.pending.is_none());
    }
}
