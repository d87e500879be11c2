//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::RaftLog;
use crate::metrics::RaftMetrics;
use crate::raft::ClusterConfig;
use crate::raft::ConfigChange;
use crate::raft::ConfigChangeOp;
use crate::raft::EntryKind;
use crate::storage::DurableStore;
use crate::storage::HardState;
use crate::storage::SnapshotMeta;
use crate::wire;
use crate::wire::Message;
use crate::NodeId;
use crate::ReadCallback;
use crate::StateMachine;
use crate::Transport;

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is running a term-neutral dry-run election.
    PreCandidate,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node has been stopped.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in pre-candidate state.
    pub fn is_pre_candidate(&self) -> bool {
        matches!(self, Self::PreCandidate)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Check if the node has been stopped.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Per-peer replication progress, valid only while Leader.
#[derive(Clone, Debug)]
struct ReplicationState {
    /// The index of the next entry to send to the peer.
    next_index: u64,
    /// The highest index known to be replicated on the peer.
    match_index: u64,
    /// The covered index of a snapshot in flight to the peer, if any.
    pending_snapshot: Option<u64>,
}

impl ReplicationState {
    fn new(next_index: u64) -> Self {
        ReplicationState {
            next_index,
            match_index: 0,
            pending_snapshot: None,
        }
    }
}

/// A queued linearizable read, waiting on a majority of heartbeat acks.
struct PendingRead {
    /// The commit index recorded when the read was accepted.
    read_index: u64,
    /// Nodes (including self) which have acknowledged leadership since.
    acks: BTreeSet<NodeId>,
    /// Set once `acks` reaches a strict majority of the voting set.
    confirmed: bool,
    cb: Option<ReadCallback>,
}

/// An in-flight leadership transfer.
#[derive(Clone, Copy, Debug)]
struct PendingTransfer {
    target: NodeId,
    /// Virtual time at which the transfer is abandoned.
    deadline: u64,
    /// Whether TimeoutNow has already been sent.
    timeout_sent: bool,
}

/// Volatile state specific to the Leader role.
#[derive(Default)]
struct LeaderState {
    /// Replication progress per peer.
    replication: BTreeMap<NodeId, ReplicationState>,
    /// Reads waiting on leadership confirmation.
    pending_reads: Vec<PendingRead>,
    /// The leadership transfer in flight, if any.
    transfer: Option<PendingTransfer>,
}

/// Volatile state for the PreCandidate and Candidate roles.
#[derive(Default)]
struct CandidateState {
    /// Peers which granted a PreVote this round, plus self.
    prevotes_granted: BTreeSet<NodeId>,
    /// Peers which granted a real vote this term, plus self.
    votes_granted: BTreeSet<NodeId>,
}

/// A partially received chunked snapshot.
struct SnapshotBuffer {
    last_index: u64,
    last_term: u64,
    data: Vec<u8>,
}

/// The core type implementing the Raft protocol.
///
/// Entirely passive: every transition happens inside a call to `tick`,
/// `receive`, or one of the local operations, all of which take `&mut self`.
pub(crate) struct RaftCore<N: Transport, M: StateMachine> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: ClusterConfig,
    /// The transport used for sending frames to peers.
    transport: N,
    /// The replicated state machine.
    machine: M,
    /// The durable store; `None` when running in memory.
    store: Option<DurableStore>,
    /// The in-memory log.
    log: RaftLog,

    /// The node's current role.
    target_state: State,
    /// The current term. Increases monotonically.
    current_term: u64,
    /// The candidate this node voted for in `current_term`.
    voted_for: Option<NodeId>,
    /// The ID of the current cluster leader, if known.
    current_leader: Option<NodeId>,
    /// The highest log index known to be committed.
    commit_index: u64,
    /// The highest log index applied to the state machine.
    last_applied: u64,
    /// The position covered by the most recent snapshot.
    snapshot_last: SnapshotMeta,
    /// A snapshot being streamed in from the leader.
    snapshot_buffer: Option<SnapshotBuffer>,

    /// Whether `start` has been called.
    started: bool,

    /// The virtual clock, advanced only by `tick`.
    clock: u64,
    /// When the election timer fires, in virtual time.
    election_deadline: u64,
    /// When the next leader heartbeat is due, in virtual time.
    heartbeat_deadline: u64,
    /// The last time a valid frame from the current leader arrived.
    last_leader_contact: u64,
    rng: StdRng,

    /// Candidate bookkeeping, present in PreCandidate/Candidate states.
    candidate: Option<CandidateState>,
    /// Leader bookkeeping, present in the Leader state.
    leader: Option<LeaderState>,
}

impl<N: Transport, M: StateMachine> RaftCore<N, M> {
    /// Create a node, recovering from the durable directory when configured.
    pub(crate) fn new(config: Config, transport: N, machine: M) -> RaftResult<Self> {
        let config = Arc::new(config);
        let rng = match config.timer_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut core = RaftCore {
            id: config.node_id,
            membership: ClusterConfig::new_initial(config.members.clone()),
            transport,
            machine,
            store: None,
            log: RaftLog::new(),
            target_state: State::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            snapshot_last: SnapshotMeta::default(),
            snapshot_buffer: None,
            started: false,
            clock: 0,
            election_deadline: 0,
            heartbeat_deadline: 0,
            last_leader_contact: 0,
            rng,
            candidate: None,
            leader: None,
            config,
        };

        if let Some(dir) = core.config.data_dir.clone() {
            let store = DurableStore::open(dir, core.config.sync_writes)?;
            core.store = Some(store);
            core.recover()?;
        }

        Ok(core)
    }

    /// Rebuild in-memory state from the durable files.
    ///
    /// Order matters: snapshot first (it supplies the machine's starting
    /// state), then the hard state, then the log replay.
    fn recover(&mut self) -> RaftResult<()> {
        let store = self.store.as_mut().expect("recover requires a store");

        if let Some((meta, state)) = store.load_snapshot()? {
            self.machine.restore(&state)?;
            self.snapshot_last = meta;
            self.commit_index = meta.last_index;
            self.last_applied = meta.last_index;
        }

        if let Some(hs) = store.load_hard_state()? {
            self.current_term = hs.current_term;
            self.voted_for = hs.voted_for;
        }

        let entries = store.read_log()?;
        let (base_index, base_term, _) = store.log_info();
        self.log = RaftLog::with_base(base_index, base_term);
        for entry in entries {
            if entry.index != self.log.last_index() + 1 {
                return Err(RaftError::Corruption(format!(
                    "log replay gap: expected index {}, found {}",
                    self.log.last_index() + 1,
                    entry.index
                )));
            }
            // Config entries in the replayed log re-establish membership;
            // an uncommitted one becomes pending again.
            if entry.kind == EntryKind::Config {
                let change = ConfigChange::decode(&entry.payload)?;
                if entry.index <= self.commit_index {
                    self.membership.apply(&change);
                } else {
                    self.membership.set_pending(change, entry.index);
                }
            }
            self.log.append(entry);
        }

        // A snapshot newer than the replayed log supersedes it entirely; one
        // covering a prefix lets us drop that prefix from memory.
        let meta = self.snapshot_last;
        if meta.last_index > 0 {
            if meta.last_index >= self.log.last_index() {
                self.log.reset(meta.last_index, meta.last_term);
            } else if meta.last_index > self.log.base_index() {
                self.log.truncate_before(meta.last_index + 1);
            }
        }

        tracing::debug!(
            id = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            base_index = self.log.base_index(),
            "recovered durable state"
        );
        Ok(())
    }

    /// Start the node.
    pub(crate) fn start(&mut self) -> RaftResult<()> {
        if self.target_state.is_shutdown() {
            return Err(RaftError::Stopped);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.reset_election_timer();

        // A single-member cluster has nobody to wait for.
        if self.membership.voting_members().len() == 1 && self.membership.contains(&self.id) {
            self.start_election()?;
        }

        tracing::debug!(id = self.id, state = ?self.target_state, "node started");
        Ok(())
    }

    /// Stop the node; further mutating operations return `Stopped`.
    pub(crate) fn stop(&mut self) {
        if self.target_state.is_shutdown() {
            return;
        }
        self.cancel_pending_reads(|| RaftError::Stopped);
        self.candidate = None;
        self.leader = None;
        self.target_state = State::Shutdown;
        tracing::debug!(id = self.id, "node stopped");
    }

    /// Advance the virtual clock, firing any due timers.
    pub(crate) fn tick(&mut self, elapsed_ms: u64) -> RaftResult<()> {
        if !self.started || self.target_state.is_shutdown() {
            return Ok(());
        }
        self.clock += elapsed_ms;

        match self.target_state {
            State::Leader => {
                if self.clock >= self.heartbeat_deadline {
                    self.heartbeat_deadline = self.clock + self.config.heartbeat_interval;
                    self.replicate_to_all()?;
                }
                self.check_transfer_deadline();
            }
            State::Follower | State::PreCandidate | State::Candidate => {
                if self.clock >= self.election_deadline {
                    self.handle_election_timeout()?;
                }
            }
            State::Shutdown => {}
        }
        Ok(())
    }

    /// Decode and dispatch a received frame.
    pub(crate) fn receive(&mut self, from: NodeId, frame: &[u8]) -> RaftResult<()> {
        if !self.started || self.target_state.is_shutdown() {
            return Ok(());
        }
        match wire::decode(frame)? {
            Message::RequestVote(req) => self.handle_vote_request(from, req),
            Message::RequestVoteResp(resp) => self.handle_vote_response(from, resp),
            Message::PreVote(req) => self.handle_prevote_request(from, req),
            Message::PreVoteResp(resp) => self.handle_prevote_response(from, resp),
            Message::AppendEntries(req) => self.handle_append_entries(from, req),
            Message::AppendEntriesResp(resp) => self.handle_append_entries_response(from, resp),
            Message::InstallSnapshot(req) => self.handle_install_snapshot(from, req),
            Message::InstallSnapshotResp(resp) => self.handle_install_snapshot_response(from, resp),
            Message::TimeoutNow(req) => self.handle_timeout_now(from, req),
        }
    }

    /// Encode and hand a message to the transport.
    fn send_message(&self, target: NodeId, msg: &Message) {
        let frame = wire::encode(msg);
        self.transport.send(target, &frame);
    }

    /// Persist a new hard state, then adopt it in memory.
    ///
    /// The write happens first: a failed write must not leave the node
    /// claiming a term or vote it has not made durable.
    fn set_hard_state(&mut self, term: u64, voted_for: Option<NodeId>) -> RaftResult<()> {
        if let Some(store) = &self.store {
            store.save_hard_state(&HardState {
                current_term: term,
                voted_for,
            })?;
        }
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Step down if `term` is newer than ours.
    ///
    /// Run for every term carried by a remote request or response.
    fn observe_term(&mut self, term: u64) -> RaftResult<()> {
        if term > self.current_term {
            tracing::debug!(id = self.id, old = self.current_term, new = term, "observed higher term");
            self.set_hard_state(term, None)?;
            self.current_leader = None;
            self.become_follower();
        }
        Ok(())
    }

    /// Transition to Follower in the current term.
    fn become_follower(&mut self) {
        if !self.target_state.is_follower() {
            tracing::debug!(id = self.id, term = self.current_term, "becoming follower");
        }
        self.cancel_pending_reads(|| RaftError::NotLeader { leader_hint: None });
        self.candidate = None;
        self.leader = None;
        self.target_state = State::Follower;
        self.reset_election_timer();
    }

    /// Redraw the randomized election timeout.
    fn reset_election_timer(&mut self) {
        let timeout = self.config.new_rand_election_timeout(&mut self.rng);
        self.election_deadline = self.clock + timeout;
    }

    /// Record contact from the current leader, deferring elections.
    fn note_leader_contact(&mut self, leader: NodeId) {
        self.current_leader = Some(leader);
        self.last_leader_contact = self.clock;
        self.reset_election_timer();
    }

    /// Whether this node would itself call an election: no leader known, or
    /// nothing heard from one within the minimum election timeout.
    fn leader_is_silent(&self) -> bool {
        self.current_leader.is_none()
            || self.clock.saturating_sub(self.last_leader_contact) >= self.config.election_timeout_min
    }

    /// Raise the commit index (monotonic) and pump the apply loop.
    fn update_commit(&mut self, index: u64) -> RaftResult<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        self.commit_index = index.min(self.log.last_index());
        if self.config.auto_apply {
            self.apply_ready(u64::MAX)?;
        }
        Ok(())
    }

    /// Apply up to `max` committed entries, in index order, exactly once.
    fn apply_ready(&mut self, max: u64) -> RaftResult<u64> {
        let mut applied = 0;
        while self.last_applied < self.commit_index && applied < max {
            let index = self.last_applied + 1;
            let config_change = {
                let entry = self
                    .log
                    .get(index)
                    .ok_or_else(|| RaftError::Corruption(format!("committed entry {} missing from log", index)))?;
                match entry.kind {
                    EntryKind::Command => {
                        self.machine.apply(entry);
                        None
                    }
                    EntryKind::Config => Some(ConfigChange::decode(&entry.payload)?),
                    EntryKind::Noop => None,
                }
            };
            self.last_applied = index;
            applied += 1;

            if let Some(change) = config_change {
                self.apply_config_change(change);
            }
        }

        if applied > 0 {
            self.complete_pending_reads();
            self.maybe_auto_compact()?;
        }
        Ok(applied)
    }

    /// Mutate the cluster config for a committed `Config` entry.
    fn apply_config_change(&mut self, change: ConfigChange) {
        tracing::info!(id = self.id, ?change, "applying config change");
        self.membership.apply(&change);

        match change.op {
            ConfigChangeOp::Add => {
                if let Some(leader) = &mut self.leader {
                    let next = self.log.last_index() + 1;
                    leader
                        .replication
                        .entry(change.node)
                        .or_insert_with(|| ReplicationState::new(next));
                }
            }
            ConfigChangeOp::Remove => {
                if let Some(leader) = &mut self.leader {
                    leader.replication.remove(&change.node);
                }
                // A leader that removed itself steps down once the entry is
                // applied (§6).
                if change.node == self.id && self.target_state.is_leader() {
                    tracing::info!(id = self.id, "removed self from cluster, stepping down");
                    self.current_leader = None;
                    self.become_follower();
                }
            }
        }
    }

    /// Fail every queued read with the given error.
    fn cancel_pending_reads(&mut self, err: impl Fn() -> RaftError) {
        if let Some(leader) = &mut self.leader {
            for mut read in leader.pending_reads.drain(..) {
                if let Some(cb) = read.cb.take() {
                    cb(Err(err()));
                }
            }
        }
    }

    /// Reject callers of leader-only operations.
    fn ensure_leader(&self) -> RaftResult<()> {
        if !self.started || self.target_state.is_shutdown() {
            return Err(RaftError::Stopped);
        }
        if !self.target_state.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.current_leader,
            });
        }
        Ok(())
    }

    /// Voting peers, excluding this node.
    fn voting_peers(&self) -> BTreeSet<NodeId> {
        let mut peers = self.membership.voting_members();
        peers.remove(&self.id);
        peers
    }

    // Accessors used by the public API.

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.target_state
    }

    pub(crate) fn current_term(&self) -> u64 {
        self.current_term
    }

    pub(crate) fn current_leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub(crate) fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub(crate) fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub(crate) fn state_machine(&self) -> &M {
        &self.machine
    }

    pub(crate) fn metrics(&self) -> RaftMetrics {
        RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership: self.membership.clone(),
            snapshot_last_index: self.snapshot_last.last_index,
        }
    }
}
